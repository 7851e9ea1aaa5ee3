use clap::{Parser, Subcommand};

/// Simple program to greet a person
#[derive(Parser, Debug)]
#[command(version, about = "archspec command line interface", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// archspec command line interface for CPU
    Cpu,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Command::Cpu => detect_cpu(),
    }
}

fn detect_cpu() {
    println!("{}", archspec::cpu::host().name());
}
