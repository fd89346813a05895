use anyhow::{Context, Result};
use orchestrate::manifest::Manifest;
use std::path::Path;

pub fn cmd_validate(steps: &Path) -> Result<u8> {
    let manifest = Manifest::load(steps).context("Invalid step manifest")?;

    println!();
    println!("Manifest: {}", steps.display());
    println!(
        "Settings: max_cycles={} max_attempts={} reboot={}",
        manifest.settings.max_cycles, manifest.settings.max_attempts, manifest.settings.reboot.mode
    );
    println!();
    println!("{:<4} {:<28} {:<10} Flags", "#", "Step", "Kind");
    println!("{:<4} {:<28} {:<10} -----", "----", "-".repeat(28), "----------");
    for (i, step) in manifest.steps.iter().enumerate() {
        let mut flags = Vec::new();
        if step.optional {
            flags.push("optional");
        }
        if step.download.is_some() {
            flags.push("download");
        }
        if step.install.is_some() {
            flags.push("install");
        }
        if step.verify.is_some() {
            flags.push("verify");
        }
        if step.requires_reboot_after {
            flags.push("reboot-after");
        }
        println!(
            "{:<4} {:<28} {:<10} {}",
            i + 1,
            step.id,
            step.kind.to_string(),
            console::style(flags.join(", ")).dim()
        );
    }
    println!();
    println!(
        "{} {} step(s) valid",
        console::style("✓").green(),
        manifest.steps.len()
    );
    Ok(0)
}
