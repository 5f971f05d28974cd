//! Terminal capability report.

use colored::Colorize;

use crate::graphics::{CapabilityProbe, GraphicsCapabilities, Multiplexer};

pub fn run(probe: &dyn CapabilityProbe) -> Result<(), i32> {
    print_capabilities(&probe.probe());
    Ok(())
}

fn print_capabilities(caps: &GraphicsCapabilities) {
    let flag = |on: bool| if on { "yes".green() } else { "no".red() };
    let or_none = |v: Option<&str>| match v {
        Some(v) => v.normal(),
        None => "(unknown)".dimmed(),
    };

    println!("{}: {}", "graphics".cyan(), flag(caps.graphics));
    println!("{}: {}", "virtual placement".cyan(), flag(caps.virtual_placement));
    println!("{}: {}", "relative placement".cyan(), flag(caps.relative_placement));
    println!("{}: {}", "kitty".cyan(), flag(caps.actual_kitty));
    println!("{}: {}", "version".cyan(), or_none(caps.version.as_deref()));
    let mux = caps.multiplexer.map(|m| match m {
        Multiplexer::Tmux => "tmux",
    });
    println!("{}: {}", "multiplexer".cyan(), or_none(mux));
    println!("{}: {}", "session".cyan(), or_none(caps.session_id.as_deref()));

    if !caps.supports_images() {
        println!();
        println!("{}", "Images will be shown as links.".yellow());
    }
}
