use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand};
use doorway::{bios, loader, Dos, Emulator, Error, Executable, MemoryManager};
use log::LevelFilter;
use std::cell::RefCell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "doorway", version, about = "Runs 16-bit real-mode DOS programs in user space")]
struct Cli {
    /// Increase log verbosity; repeat for more.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and execute a COM, MZ EXE or raw image file.
    Run {
        file: PathBuf,
        /// Arguments passed to the guest in its PSP command tail.
        args: Vec<String>,
    },
    /// Execute a hex-encoded instruction stream.
    Inst { hex: String },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = e.print();
                process::exit(0);
            }
            _ => {
                let _ = e.print();
                process::exit(1);
            }
        },
    };

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli.command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("doorway: {}", e);
            process::exit(1);
        }
    }
}

fn run(command: Command) -> Result<i32, Error> {
    let (exe, args) = match command {
        Command::Run { file, args } => (Executable::read(&file)?, args),
        Command::Inst { hex } => (Executable::com(decode_hex(&hex)?), Vec::new()),
    };

    let mut emu = Emulator::new()?;
    let mut mm = MemoryManager::new();
    let program = loader::load(emu.engine_mut(), &mut mm, &exe, &args)?;

    let dos = Rc::new(RefCell::new(Dos::new()));
    emu.register(0x20, {
        let dos = Rc::clone(&dos);
        move |uc, intr| dos.borrow_mut().int20(uc, intr)
    });
    emu.register(0x21, {
        let dos = Rc::clone(&dos);
        move |uc, intr| dos.borrow_mut().int21(uc, intr)
    });
    emu.register(0x1A, bios::int1a);

    emu.start(program.entry)?;

    let code = dos.borrow().exit_code().unwrap_or(0);
    Ok(i32::from(code))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, Error> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if hex.len() % 2 != 0 {
        return Err(Error::Malformed("odd-length hex string".into()));
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::Malformed(format!("bad hex digit at byte {}", i / 2)))
        })
        .collect()
}
