//! # OSD Command Line Tool
//!
//! Talks to the debug modules of a chip, either through a relay daemon or a directly
//! attached device. `osd sim` runs a simulated chip behind a relay daemon, which is
//! handy for trying the other commands without hardware.
mod hexdump;

use std::error::Error;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use env_logger::Env;
use osd_client::{
    Builder, Context, ModuleIndex, SystemInfo,
    directory::ModuleExtra,
    transport::{DaemonTransport, DirectTransport},
};
use osd_sim::{
    SimSystem,
    modules::{CoreTraceModule, MemoryModule, TraceModule},
    server,
};

const DEFAULT_DAEMON: &str = "127.0.0.1:9537";

#[derive(Subcommand, Clone)]
enum RegCommand {
    /// Read a 16 bit register
    Read {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u16>)]
        reg: u16,
    },
    /// Write a 16 bit register
    Write {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u16>)]
        reg: u16,
        #[arg(value_parser = maybe_hex::<u16>)]
        value: u16,
    },
}

#[derive(Subcommand, Clone)]
enum MemCommand {
    /// Read memory and print it, or store it in a file
    Read {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u64>)]
        addr: u64,
        #[arg(value_parser = maybe_hex::<usize>)]
        len: usize,
        #[arg(short, long, help = "Write the data to this file instead of printing it")]
        output: Option<PathBuf>,
    },
    /// Write the contents of a binary file to memory
    Write {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
        #[arg(value_parser = maybe_hex::<u64>)]
        addr: u64,
        file: PathBuf,
    },
}

#[derive(Parser, Clone)]
struct SimArgs {
    #[arg(short, long, default_value = "9537")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[arg(long, default_value = "0x100000", value_parser = maybe_hex::<usize>)]
    memory_size: usize,

    #[arg(long, default_value = "64", help = "The maximum packet length in words")]
    max_packet_len: u16,
}

/// Commands that talk to a connected system.
#[derive(Subcommand, Clone)]
enum DebugCommand {
    /// List the modules of the system
    Ls,
    #[command(subcommand)]
    Reg(RegCommand),
    #[command(subcommand)]
    Mem(MemCommand),
    /// Reset the system
    Reset {
        #[arg(long, help = "Keep the cores halted after the reset")]
        halt: bool,
    },
    /// Start the cores after a halting reset
    Start,
    Stall {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
    },
    Unstall {
        #[arg(value_parser = maybe_hex::<u16>)]
        module: u16,
    },
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(flatten)]
    Debug(DebugCommand),
    /// Serve a simulated system as a relay daemon
    Sim(SimArgs),
}

#[derive(Parser)]
#[command(about = "Access the on-chip debug interconnect of a chip", long_about=None)]
struct Args {
    #[arg(long, help = "Address of the relay daemon", conflicts_with = "device")]
    daemon: Option<String>,

    #[arg(long, help = "Path of a directly attached device")]
    device: Option<PathBuf>,

    #[arg(long, help = "Log every packet (implies trace logging)")]
    trace: bool,

    #[arg(
        long,
        help = "Fail requests without response after this many milliseconds, 0 waits forever",
        default_value = "2000"
    )]
    timeout_ms: u64,

    #[clap(subcommand)]
    command: Command,
}

fn open(args: &Args) -> Result<Context, Box<dyn Error>> {
    let mut builder = Builder::new().debug_trace(args.trace);
    if args.timeout_ms > 0 {
        builder = builder.rpc_timeout(Duration::from_millis(args.timeout_ms));
    }
    let ctx = match &args.device {
        Some(path) => {
            log::info!("Using device {}", path.display());
            builder.build(DirectTransport::new(path))
        }
        None => {
            let addr = args.daemon.as_deref().unwrap_or(DEFAULT_DAEMON);
            log::info!("Connecting to daemon at {}", addr);
            builder.build(DaemonTransport::new(addr)?)
        }
    };
    ctx.connect()?;
    Ok(ctx)
}

fn print_system(info: &SystemInfo) {
    println!(
        "System {:#06x}, {} modules, max packet length {}",
        info.identifier(),
        info.module_count(),
        info.max_packet_len()
    );
    for module in info.modules().iter().skip(1) {
        let details = match &module.extra {
            ModuleExtra::Memory(mem) => {
                let regions: Vec<String> = mem
                    .regions
                    .iter()
                    .map(|r| format!("{:#x}+{:#x}", r.base_addr, r.size))
                    .collect();
                format!(
                    "data {} bit, address {} bit, regions [{}]",
                    mem.data_width,
                    mem.addr_width,
                    regions.join(", ")
                )
            }
            ModuleExtra::Trace(trace) => format!("values {} bit", trace.value_width),
            ModuleExtra::CoreTrace(ctm) => format!(
                "address {} bit, data {} bit",
                ctm.addr_width, ctm.data_width
            ),
            ModuleExtra::None => String::new(),
        };
        println!(
            "{:>5}  {:<12} v{:<3} {}",
            module.index.to_string(),
            module.module_type.to_string(),
            module.version,
            details
        );
    }
}

fn run(ctx: &Context, command: DebugCommand) -> Result<(), Box<dyn Error>> {
    match command {
        DebugCommand::Ls => {
            if let Some(info) = ctx.system_info() {
                print_system(&info);
            }
        }
        DebugCommand::Reg(RegCommand::Read { module, reg }) => {
            let addr = ctx.module(ModuleIndex::new(module))?.addr;
            println!("{:#06x}", ctx.read16(addr, reg)?);
        }
        DebugCommand::Reg(RegCommand::Write { module, reg, value }) => {
            let addr = ctx.module(ModuleIndex::new(module))?.addr;
            ctx.write16(addr, reg, value)?;
        }
        DebugCommand::Mem(MemCommand::Read {
            module,
            addr,
            len,
            output,
        }) => {
            let data = ctx.memory_read(ModuleIndex::new(module), addr, len)?;
            match output {
                Some(path) => {
                    fs::write(&path, &data)?;
                    log::info!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => print!("{}", hexdump::hexdump(addr, &data)),
            }
        }
        DebugCommand::Mem(MemCommand::Write { module, addr, file }) => {
            let data = fs::read(&file)?;
            log::info!("Loading {} bytes from {}", data.len(), file.display());
            ctx.memory_write(ModuleIndex::new(module), addr, &data)?;
        }
        DebugCommand::Reset { halt } => ctx.reset(halt)?,
        DebugCommand::Start => ctx.start_cores()?,
        DebugCommand::Stall { module } => ctx.stall(ModuleIndex::new(module))?,
        DebugCommand::Unstall { module } => ctx.unstall(ModuleIndex::new(module))?,
    }
    Ok(())
}

fn run_sim(args: SimArgs) -> Result<(), Box<dyn Error>> {
    let mut system = SimSystem::new(0x05d0, args.max_packet_len);
    system.add(MemoryModule::new(32, 32, 0, args.memory_size));
    system.add(TraceModule::new(32));
    system.add(CoreTraceModule::new(32, 32));
    log::debug!("Simulated system with {} modules", system.module_count());

    let addr = SocketAddr::new(args.ip, args.port);
    let server = server::Builder::new()
        .max_packet_words(args.max_packet_len as usize + 1)
        .build(system);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::select! {
            result = server.listen(addr) => result?,
            _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
        }
        Ok::<(), Box<dyn Error>>(())
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let default_filter = if args.trace { "trace" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    match args.command.clone() {
        Command::Sim(sim) => run_sim(sim),
        Command::Debug(command) => {
            let ctx = open(&args)?;
            run(&ctx, command)?;
            ctx.disconnect()?;
            Ok(())
        }
    }
}
