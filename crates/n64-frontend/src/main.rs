use std::path::{Path, PathBuf};

use n64_core::cart::{checksum, cic, rom, Cartridge};
use n64_core::debug::RegisterSnapshot;
use n64_core::{EmulatorConfig, N64Error, N64};

const DEFAULT_STEPS: u64 = 10_000_000;

struct Options {
    rom_path: PathBuf,
    steps: u64,
    trace: usize,
    fix_checksum: bool,
}

fn usage() -> ! {
    eprintln!("Usage: n64 [--steps N] [--trace N] [--fix-checksum] <rom_path>");
    std::process::exit(1);
}

fn parse_count(flag: &str, value: Option<String>) -> u64 {
    match value.as_deref().map(str::parse::<u64>) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("{} expects a number", flag);
            usage();
        }
    }
}

fn parse_args() -> Options {
    let mut args = std::env::args().skip(1);
    let mut rom_path = None;
    let mut steps = DEFAULT_STEPS;
    let mut trace = 0;
    let mut fix_checksum = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--steps" => steps = parse_count("--steps", args.next()),
            "--trace" => trace = parse_count("--trace", args.next()) as usize,
            "--fix-checksum" => fix_checksum = true,
            "-h" | "--help" => usage(),
            flag if flag.starts_with("--") => {
                eprintln!("Unknown option {}", flag);
                usage();
            }
            path => rom_path = Some(PathBuf::from(path)),
        }
    }
    let Some(rom_path) = rom_path else { usage() };
    Options {
        rom_path,
        steps,
        trace,
        fix_checksum,
    }
}

/// Recompute CRC1/CRC2 and write a big-endian image next to the input.
fn fix_checksum(path: &Path) -> Result<PathBuf, rom::RomError> {
    let (_, mut data) = rom::load_rom(path)?;
    let variant = cic::detect(&data);
    let (crc1, crc2) = checksum::update_rom_checksum(&mut data, variant)?;
    let out = path.with_extension("z64");
    std::fs::write(&out, &data)?;
    log::info!(
        "{}: {} checksum {:08X} {:08X}",
        out.display(),
        variant,
        crc1,
        crc2
    );
    Ok(out)
}

fn main() {
    env_logger::init();
    let options = parse_args();

    if options.fix_checksum {
        match fix_checksum(&options.rom_path) {
            Ok(out) => println!("wrote {}", out.display()),
            Err(e) => {
                eprintln!("Checksum update failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let mut config = EmulatorConfig::from_env();
    if options.trace > 0 {
        config.trace_depth = config.trace_depth.max(options.trace);
    }
    let booted = Cartridge::load(&options.rom_path)
        .map_err(N64Error::from)
        .and_then(|cart| N64::with_config(cart, config));
    let mut n64 = match booted {
        Ok(n64) => n64,
        Err(e) => {
            eprintln!("Failed to load ROM: {}", e);
            std::process::exit(1);
        }
    };

    let started = std::time::Instant::now();
    let result = n64.run_for(options.steps);
    let elapsed = started.elapsed();

    if let Some(trace) = n64.cpu.trace.as_ref() {
        let shown = match options.trace {
            0 => trace.len(),
            n => n.min(trace.len()),
        };
        println!("--- last {} instructions ---", shown);
        for entry in trace.recent(shown) {
            println!("{}", entry);
        }
    }
    println!("{}", RegisterSnapshot::capture(&n64.cpu));
    if let Some(line) = n64.engine().dynarec_stats_line() {
        println!("{}", line);
    }
    println!(
        "{} cycles in {:.2?} ({:.1} MHz)",
        n64.cycles,
        elapsed,
        n64.cycles as f64 / elapsed.as_secs_f64().max(1e-9) / 1e6
    );

    if let Err(e) = result {
        eprintln!("Emulation stopped: {}", e);
        std::process::exit(1);
    }
}
