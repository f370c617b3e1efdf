//! Terminal story player.
//!
//! Loads a compiled story image and drives a runner over stdin/stdout:
//! print lines while the runner can continue, list choices when it blocks,
//! read a choice number, repeat. Exits 0 when the story ends normally.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use weft::Story;

#[derive(Parser)]
#[command(name = "weft", version, about = "Play a compiled story from the terminal")]
struct Args {
    /// Compiled story image to play.
    story: PathBuf,

    /// Seed for the runner's random number generator.
    #[arg(long)]
    seed: Option<u32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let story = Story::from_file(&args.story)
        .with_context(|| format!("loading {}", args.story.display()))?;

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals);
    if let Some(seed) = args.seed {
        runner.set_rng_seed(seed);
    }

    let stdin = io::stdin();
    let mut input = stdin.lock().lines();

    loop {
        while runner.can_continue() {
            println!("{}", runner.getline()?);
        }

        if !runner.has_choices() {
            break;
        }

        for choice in runner.choices() {
            println!("{}: {}", choice.index() + 1, choice.text());
        }
        print!("?> ");
        io::stdout().flush()?;

        let Some(line) = input.next() else {
            break;
        };
        let picked = match line?.trim().parse::<usize>() {
            Ok(n) if n >= 1 => n - 1,
            _ => {
                eprintln!("enter a choice number");
                continue;
            }
        };
        if let Err(err) = runner.choose(picked) {
            eprintln!("{err}");
        }
    }

    Ok(())
}
