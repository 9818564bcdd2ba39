//! Enumerate counters at which interesting boards come up.
//!
//! A Mystery board has 48 squares; one of them is the losing square. The
//! player pops squares one at a time and the board loses as soon as the draw
//! for the remaining squares lands on the mystery one.
//!
//! - `all`: every counter, as if the board were played straight from it.
//! - `encountered`: back-to-back sessions where 48 draws build the board and
//!   the following draws play it, which is what real clients see.
//!
//! `--gleich N` instead lists Gleich boards: 48 consecutive draws using at
//! most `N` colour runs, printed as `index+runs`.

use std::env;
use std::io::{self, BufWriter, Write};
use std::str::FromStr;

use powgate::prng::counter_of;
use powgate::search::SQUARES;
use powgate::{DomainSearch, GleichProbe, KeyPool, Probe, SessionRand, Source, WindowProbe};
use rand::rngs::OsRng;
use rand::RngCore;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Encountered,
    Gleich(u32),
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "encountered" => Ok(Self::Encountered),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

struct Config {
    key: u64,
    counter: u64,
    take: usize,
    masks: u32,
    mode: Mode,
    workers: Option<usize>,
}

fn run() -> Result<(), String> {
    let config = parse_args()?;
    let mut stdout = BufWriter::new(io::stdout().lock());

    let mut counter = config.counter;
    if counter == 0 && config.masks > 0 {
        counter = counter_of(OsRng.next_u32(), 0);
    }

    for _ in 0..config.masks.max(1) {
        let source = Source::new(counter, config.key);
        let rand = SessionRand {
            mask: source.mask(),
            key: [(config.key >> 32) as u32, config.key as u32],
        };
        writeln!(
            stdout,
            "{}",
            serde_json::to_string(&rand).map_err(|e| e.to_string())?
        )
        .map_err(io_err)?;

        match config.mode {
            Mode::All => report(
                &mut stdout,
                config.take,
                search(source, config.workers, || {
                    WindowProbe::new(SQUARES, play_mystery)
                }),
                |c: u64| (c as u32).to_string(),
            )?,
            Mode::Encountered => report(
                &mut stdout,
                config.take,
                search(source, config.workers, || Encountered),
                |c: u64| (c as u32).to_string(),
            )?,
            Mode::Gleich(max_colors) => report(
                &mut stdout,
                config.take,
                search(source, config.workers, move || GleichProbe::new(max_colors)),
                |(c, colors): (u64, u32)| format!("{}+{colors}", c as u32),
            )?,
        }
        writeln!(stdout, "\n").map_err(io_err)?;

        counter = counter_of(OsRng.next_u32(), 0);
    }

    Ok(())
}

fn search<F, P>(source: Source, workers: Option<usize>, factory: F) -> impl Iterator<Item = P::Item>
where
    F: Fn() -> P + Send + Sync + 'static,
    P: Probe + 'static,
{
    let mut search = DomainSearch::new(source, factory);
    if let Some(n) = workers {
        search = search.workers(n);
    }
    search.iter()
}

/// Print the first `take` results as they arrive, or their total if `take` is 0.
fn report<T>(
    out: &mut impl Write,
    take: usize,
    found: impl Iterator<Item = T>,
    show: impl Fn(T) -> String,
) -> Result<(), String> {
    if take > 0 {
        for item in found.take(take) {
            write!(out, "{} ", show(item)).map_err(io_err)?;
            out.flush().map_err(io_err)?;
        }
    } else {
        write!(out, "{} boards found", found.count()).map_err(io_err)?;
    }
    Ok(())
}

/// Play a board from the current draw; `true` if it can be won.
fn play_mystery(src: &mut Source) -> bool {
    for i in 0..SQUARES - 1 {
        let remaining = SQUARES - i - 1;
        if remaining > 1 && src.next_below(remaining + 1) == remaining {
            return false;
        }
    }
    true
}

/// Sessions laid end to end: build, then play, then the next session starts
/// wherever the previous one stopped drawing.
struct Encountered;

impl Probe for Encountered {
    type Item = u64;

    fn next_match(&mut self, src: &mut Source, limit: u32) -> Option<u64> {
        while src.in_range(u64::from(2 * SQUARES - 1), limit) {
            let start = src.counter;
            src.seek(start + u64::from(SQUARES));
            if play_mystery(src) {
                return Some(start);
            }
        }
        None
    }
}

fn parse_args() -> Result<Config, String> {
    let mut args = env::args().skip(1);

    let mut key = KeyPool::default()
        .get(0)
        .ok_or_else(|| "empty key pool".to_owned())?;
    let mut counter: u64 = 0;
    let mut take: usize = 100;
    let mut masks: u32 = 0;
    let mut mode: Option<Mode> = None;
    let mut workers: Option<usize> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--key" => {
                let value = parse_next::<String>(&mut args, "--key")?;
                key = parse_u64(&value).ok_or_else(|| "invalid value for --key".to_owned())?;
            }
            "--cnt" => {
                counter = parse_next::<u64>(&mut args, "--cnt")?;
            }
            "--take" => {
                take = parse_next::<usize>(&mut args, "--take")?;
            }
            "--masks" => {
                masks = parse_next::<u32>(&mut args, "--masks")?;
            }
            "--mode" => {
                mode = Some(parse_next::<Mode>(&mut args, "--mode")?);
            }
            "--gleich" => {
                mode = Some(Mode::Gleich(parse_next::<u32>(&mut args, "--gleich")?));
            }
            "--workers" => {
                workers = Some(parse_next::<usize>(&mut args, "--workers")?);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let mode = mode.ok_or_else(|| "--mode or --gleich is required".to_owned())?;
    if !powgate::prng::is_valid_key(key) {
        return Err(format!("key {key:#018x} lacks digit diversity"));
    }

    Ok(Config {
        key,
        counter,
        take,
        masks,
        mode,
        workers,
    })
}

fn parse_u64(value: &str) -> Option<u64> {
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_next<T: FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T, String> {
    let value = args
        .next()
        .ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse::<T>()
        .map_err(|_| format!("invalid value for {flag}"))
}

fn io_err(err: io::Error) -> String {
    err.to_string()
}

fn print_help() {
    println!(
        "Usage: cargo run --release --example find_boards -- (--mode <all|encountered> | --gleich <u32>) [options]\n\
Options:\n  --gleich <u32>    List boards with at most this many colour runs instead of Mystery boards\n  --key <u64>       Generator key, decimal or 0x-prefixed hex (default: first curated key)\n  --cnt <u64>       Counter to start at (default 0)\n  --take <usize>    Results to print; 0 prints the total (default 100)\n  --masks <u32>     Scan this many random masks when --cnt is 0\n  --workers <usize> Worker threads (default: available parallelism)\n  --help            Show this message"
    );
}
