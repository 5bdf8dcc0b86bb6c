//! The `judgekit init` command.

use anyhow::Result;

use judgekit_providers::config::STARTER_CONFIG;

pub fn execute() -> Result<()> {
    if std::path::Path::new("judgekit.toml").exists() {
        println!("judgekit.toml already exists, skipping.");
    } else {
        std::fs::write("judgekit.toml", STARTER_CONFIG)?;
        println!("Created judgekit.toml");
    }

    println!("\nNext steps:");
    println!("  1. Export ANTHROPIC_API_KEY, GEMINI_API_KEY and DEEPSEEK_API_KEY");
    println!("  2. Run: judgekit validate-config");
    println!("  3. Run: judgekit judge --tasks tasks.jsonl --run-dir runs/first");
    println!("  4. Run: judgekit report --run-dir runs/first --baseline <config> --candidate <config>");

    Ok(())
}
