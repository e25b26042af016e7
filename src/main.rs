use std::{fs, path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use dfu_state_patcher::{img, sim::SimulatedTarget, MemoryLayout};
use env_logger::Env;

/// Room for the patched verification context in a dry run.
const ARENA_SIZE: u32 = 0x100;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Applies the patch to captured memory dumps and reports every changed word
    DryRun {
        /// SRAM dump
        #[arg(long)]
        sram: PathBuf,
        #[arg(long, default_value = "0x22000000", value_parser = parse_address)]
        sram_base: u32,
        /// Bootrom dump, needed for the template verification context
        #[arg(long)]
        rom: Option<PathBuf>,
        #[arg(long, default_value = "0x20000000", value_parser = parse_address)]
        rom_base: u32,
        /// Unused address to map a scratch heap at
        #[arg(long, default_value = "0x23000000", value_parser = parse_address)]
        arena: u32,
        /// Where to write the patched SRAM
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Prepends an IMG1 header to a raw binary
    Wrap { input: PathBuf, output: PathBuf },
}

fn parse_address(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(&digits.replace('_', ""), 16).map_err(|e| format!("bad address {s}: {e}"))
}

/// Rejects a mapping that would run past the top of the 32-bit address space.
fn check_span(what: &str, base: u32, len: usize) -> Result<(), String> {
    u32::try_from(len)
        .ok()
        .and_then(|len| base.checked_add(len))
        .map(|_| ())
        .ok_or_else(|| format!("{what} of {len:#x} bytes at {base:#010x} runs past 0xffffffff"))
}

fn changed_words(before: &[u8], after: &[u8], base: u32) -> Vec<(u32, u32, u32)> {
    before
        .chunks_exact(4)
        .zip(after.chunks_exact(4))
        .enumerate()
        .filter(|(_, (old, new))| old != new)
        .map(|(i, (old, new))| {
            let word = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (base + i as u32 * 4, word(old), word(new))
        })
        .collect()
}

fn dry_run(
    sram: PathBuf,
    sram_base: u32,
    rom: Option<PathBuf>,
    rom_base: u32,
    arena: u32,
    out: Option<PathBuf>,
) -> Result<(), String> {
    let layout = MemoryLayout::NANO7G_DFU;
    let sram_bytes = fs::read(&sram).map_err(|e| format!("cannot read {}: {e}", sram.display()))?;
    check_span("SRAM dump", sram_base, sram_bytes.len())?;
    check_span("scratch arena", arena, ARENA_SIZE as usize)?;
    let before = sram_bytes.clone();

    let mut target = SimulatedTarget::new();
    if let Some(rom) = rom {
        let rom_bytes = fs::read(&rom).map_err(|e| format!("cannot read {}: {e}", rom.display()))?;
        check_span("bootrom dump", rom_base, rom_bytes.len())?;
        target.map(rom_base, rom_bytes);
    } else {
        log::warn!(
            "No bootrom dump given, the template context at {:#010x} must be in the SRAM dump.",
            layout.context_template
        );
    }
    target
        .map(sram_base, sram_bytes)
        .map_zeroed(arena, ARENA_SIZE)
        .set_heap(arena, ARENA_SIZE);

    let report = dfu_state_patcher::apply(&mut target, &layout).map_err(|e| e.to_string())?;
    log::info!(
        "Verification context {:#010x} replaced by {:#010x}.",
        report.previous_context,
        report.context
    );

    let after = target.region(sram_base).unwrap_or_default();
    for (addr, old, new) in changed_words(&before, after, sram_base) {
        log::info!("{addr:#010x}: {old:#010x} -> {new:#010x}");
    }
    match target.product_name(&layout) {
        Ok(name) => log::info!("Product string now reads {name:?}."),
        Err(e) => log::warn!("Could not read back the product string. {e}."),
    }

    if let Some(out) = out {
        fs::write(&out, after).map_err(|e| format!("cannot write {}: {e}", out.display()))?;
        log::info!("Patched SRAM written to {}.", out.display());
    }
    Ok(())
}

fn wrap(input: PathBuf, output: PathBuf) -> Result<(), String> {
    let body = fs::read(&input).map_err(|e| format!("cannot read {}: {e}", input.display()))?;
    let image = if img::is_wrapped(&body) {
        log::info!("{} already carries an IMG1 header.", input.display());
        body
    } else {
        img::wrap_image(&body).map_err(|e| e.to_string())?
    };
    fs::write(&output, &image).map_err(|e| format!("cannot write {}: {e}", output.display()))?;
    log::info!("Wrote {:#x} bytes to {}.", image.len(), output.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::DryRun {
            sram,
            sram_base,
            rom,
            rom_base,
            arena,
            out,
        } => dry_run(sram, sram_base, rom, rom_base, arena, out),
        Commands::Wrap { input, output } => wrap(input, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}.");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfu_state_patcher::sim::{ROM_BASE, SRAM_BASE};

    #[test]
    fn addresses_parse_with_or_without_prefix() {
        assert_eq!(parse_address("0x2202_BA3C"), Ok(0x2202_BA3C));
        assert_eq!(parse_address("22000000"), Ok(SRAM_BASE));
        assert_eq!(parse_address("0X20000000"), Ok(ROM_BASE));
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn mappings_past_the_address_space_are_rejected() {
        assert_eq!(check_span("scratch arena", 0x2300_0000, ARENA_SIZE as usize), Ok(()));
        assert_eq!(check_span("scratch arena", 0xFFFF_FE00, ARENA_SIZE as usize), Ok(()));
        assert!(check_span("scratch arena", 0xFFFF_FF80, ARENA_SIZE as usize).is_err());
        assert!(check_span("SRAM dump", SRAM_BASE, usize::MAX).is_err());
    }

    #[test]
    fn changed_words_are_reported_with_addresses() {
        let before = [0u8; 12];
        let mut after = before;
        after[4..8].copy_from_slice(&0x2202_BA3Cu32.to_le_bytes());
        assert_eq!(
            changed_words(&before, &after, 0x2202_FFF4),
            vec![(0x2202_FFF8, 0, 0x2202_BA3C)]
        );
    }
}
