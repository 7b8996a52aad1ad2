use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use armtrap_core::config::SessionConfig;
use armtrap_core::debug_state::WatchAccess;
use armtrap_core::events::DebuggerEvent;
use armtrap_core::platform::simulated::SimulatedController;
use armtrap_core::signals::SignalPolicyTable;
use armtrap_core::threads::ThreadScope;
use armtrap_core::types::ThreadPort;
use armtrap_core::{Address, ArmtrapResult, Debugger, ProcessController, ProcessId};
use armtrap_utils::{init_logging, parse_address, EnvOverrides, LogFormat, LogLevel, LogSettings};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

/// An ARM64 native-process debugger built around Mach exception ports.
#[derive(Parser, Debug)]
#[command(name = "armtrap")]
#[command(version)]
#[command(about = "An ARM64 native-process debugger built around Mach exception ports", long_about = None)]
struct Cli
{
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct LoggingArgs
{
    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format (pretty or json); overrides ARMTRAP_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    /// Also log to this file or directory; overrides ARMTRAP_LOG_FILE
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SessionArgs
{
    /// Link-time base of the main image, used to compute the ASLR slide
    #[arg(long, global = true, value_parser = parse_hex)]
    load_base: Option<u64>,
    /// How often to check that the target is still alive, in milliseconds
    #[arg(long, global = true)]
    death_poll_ms: Option<u64>,
    /// Only re-enumerate threads when a trap comes from an unknown thread
    #[arg(long, global = true, default_value_t = false)]
    lazy_thread_refresh: bool,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Attach to a running process, report on it and detach
    Attach
    {
        /// Process ID (PID) to attach to
        pid: u32,
        /// Set a breakpoint at this address (hex or decimal); repeatable
        #[arg(long = "break", value_parser = parse_hex)]
        breakpoints: Vec<u64>,
        /// Watch writes to ADDRESS:SIZE; repeatable
        #[arg(long = "watch", value_parser = parse_watch)]
        watchpoints: Vec<(u64, u8)>,
        /// Breakpoint and watchpoint addresses are unslid image offsets
        #[arg(long, default_value_t = false)]
        slide: bool,
        /// Continue once and report the first stop before detaching
        #[arg(long = "continue", default_value_t = false)]
        run: bool,
        /// Give up waiting for that stop after this many milliseconds
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
    /// Print the default signal handling table
    Signals,
    /// Run a breakpoint and watchpoint walkthrough against a simulated target
    Demo,
}

fn parse_hex(value: &str) -> Result<u64, String>
{
    parse_address(value).ok_or_else(|| format!("'{value}' is not an address"))
}

fn parse_watch(value: &str) -> Result<(u64, u8), String>
{
    let (address, size) = value.split_once(':').unwrap_or((value, "8"));
    let size = size.parse::<u8>().map_err(|err| format!("bad size in '{value}': {err}"))?;
    Ok((parse_hex(address)?, size))
}

fn main()
{
    let cli = Cli::parse();

    let mut log_settings = LogSettings::from_env();
    log_settings.level = cli.logging.log_level;
    if let Some(format) = cli.logging.log_format {
        log_settings.format = format;
    }
    if let Some(file) = cli.logging.log_file.clone() {
        log_settings.file = Some(file);
    }
    let _log_guard = match init_logging(&log_settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let config = match session_config(&cli.session) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    };

    if let Err(e) = run_command(cli.command, config) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Defaults, then environment, then flags.
fn session_config(args: &SessionArgs) -> Result<SessionConfig, armtrap_utils::ConfigError>
{
    let env = EnvOverrides::from_env()?;
    let mut config = SessionConfig::default();
    if let Some(base) = args.load_base.or(env.load_base) {
        config = config.with_load_base(base);
    }
    if let Some(interval) = args.death_poll_ms.map(Duration::from_millis).or(env.death_poll_interval) {
        config = config.with_death_poll_interval(interval);
    }
    if args.lazy_thread_refresh {
        config = config.with_refresh_threads_on_trap(false);
    }
    debug!(?config, "session configuration");
    Ok(config)
}

#[cfg(target_os = "macos")]
fn native_controller() -> ArmtrapResult<Arc<dyn ProcessController>>
{
    Ok(Arc::new(armtrap_core::MachController::new()))
}

#[cfg(not(target_os = "macos"))]
fn native_controller() -> ArmtrapResult<Arc<dyn ProcessController>>
{
    Err(armtrap_core::ArmtrapError::InvalidArgument(
        "attaching to a live process is only supported on macOS; try 'armtrap demo'".to_string(),
    ))
}

fn run_command(command: Commands, config: SessionConfig) -> ArmtrapResult<()>
{
    match command {
        Commands::Attach {
            pid,
            breakpoints,
            watchpoints,
            slide,
            run,
            timeout_ms,
        } => {
            info!("Attaching to process {pid}");
            let debugger = Debugger::new(native_controller()?, config);
            debugger.attach(ProcessId(pid))?;
            println!("Successfully attached to process {pid}");

            let result = inspect(&debugger, &breakpoints, &watchpoints, slide, run.then(|| Duration::from_millis(timeout_ms)));
            let detached = debugger.detach();
            result?;
            detached?;
            println!("Detached");
            Ok(())
        }
        Commands::Signals => {
            print!("{}", SignalPolicyTable::default());
            Ok(())
        }
        Commands::Demo => demo(config),
    }
}

/// Headless session body: report, arm, optionally run once.
fn inspect(
    debugger: &Debugger,
    breakpoints: &[u64],
    watchpoints: &[(u64, u8)],
    slide: bool,
    run: Option<Duration>,
) -> ArmtrapResult<()>
{
    let offset = if slide { debugger.aslr_slide()? } else { 0 };
    print_session_info(debugger)?;

    for address in breakpoints {
        let address = Address::new(address.wrapping_add(offset));
        let id = debugger.set_breakpoint(address, false, ThreadScope::All)?;
        println!("  Breakpoint {id} at {address}");
    }
    for (address, size) in watchpoints {
        let address = Address::new(address.wrapping_add(offset));
        let id = debugger.set_watchpoint(address, *size, WatchAccess::Write, ThreadScope::All)?;
        println!("  Watchpoint {id} at {address} ({size} bytes)");
    }

    if let Some(timeout) = run {
        let events = debugger.subscribe();
        let seq = debugger.resume()?;
        match debugger.wait_for_stop(seq, Some(timeout))? {
            Some(stop) => println!("{stop}"),
            None => {
                println!("No stop within {timeout:?}, interrupting");
                debugger.interrupt()?;
            }
        }
        for event in events.try_iter() {
            if let DebuggerEvent::Notification(report) = event {
                println!("  {report}");
            }
        }
    }
    Ok(())
}

fn print_session_info(debugger: &Debugger) -> ArmtrapResult<()>
{
    println!("\nDebugger Information:");
    if let Some(pid) = debugger.pid() {
        println!("  PID: {pid}");
    }
    println!("  ASLR slide: {:#x}", debugger.aslr_slide()?);

    let threads = debugger.list_threads()?;
    println!("  Threads: {}", threads.len());
    for thread in &threads {
        let name = if thread.name.is_empty() { "-" } else { &thread.name };
        println!("    {} port {} tid {:#x} {name}", thread.id, thread.port, thread.kernel_id);
    }
    if let Some(focused) = debugger.focused_thread()? {
        let regs = debugger.read_registers(Some(focused))?;
        println!("  Focused thread {focused}: pc {:#x} sp {:#x}", regs.pc, regs.sp);
    }
    Ok(())
}

/// Attach, hit a breakpoint, step over it, then catch a watched store.
fn demo(config: SessionConfig) -> ArmtrapResult<()>
{
    const BASE: u64 = 0x1_0000_0000;
    const SLIDE: u64 = 0x4000;
    const MAIN: ThreadPort = ThreadPort(0x103);
    const DATA: u64 = BASE + SLIDE + 0x2000;

    let sim = Arc::new(
        SimulatedController::new(100)
            .with_region(BASE + SLIDE, vec![0x1f; 0x4000])
            .with_thread(MAIN, BASE + SLIDE),
    );
    sim.write_memory(Address::new(DATA), &5u32.to_le_bytes())?;

    let debugger = Debugger::new(sim.clone(), config);
    let events = debugger.subscribe();
    debugger.attach(ProcessId(100))?;
    print_session_info(&debugger)?;

    let target = Address::new(BASE + SLIDE + 0x1000);
    let bp = debugger.set_breakpoint(target, false, ThreadScope::All)?;
    let wp = debugger.set_watchpoint(Address::new(DATA), 4, WatchAccess::Write, ThreadScope::All)?;
    println!("Breakpoint {bp} at {target}, watchpoint {wp} at {DATA:#x}");

    let seq = debugger.resume()?;
    sim.run_to(MAIN, target.value());
    if let Some(stop) = debugger.wait_for_stop(seq, Some(Duration::from_secs(5)))? {
        println!("{stop}");
    }

    debugger.resume()?;
    sim.wait_idle(Duration::from_secs(5));
    sim.store(MAIN, DATA, &9u32.to_le_bytes())?;
    sim.wait_idle(Duration::from_secs(5));

    debugger.interrupt()?;
    for breakpoint in debugger.breakpoints()? {
        println!("{breakpoint}");
    }
    debugger.detach()?;

    for event in events.try_iter() {
        println!("event: {}", event.describe());
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_watch_argument_parsing()
    {
        assert_eq!(parse_watch("0x1000:4"), Ok((0x1000, 4)));
        assert_eq!(parse_watch("4096"), Ok((4096, 8)));
        assert!(parse_watch("0x1000:big").is_err());
        assert!(parse_hex("nowhere").is_err());
    }

    #[test]
    fn test_flags_override_defaults()
    {
        let cli = Cli::parse_from([
            "armtrap",
            "--load-base",
            "0x100000000",
            "--death-poll-ms",
            "50",
            "--lazy-thread-refresh",
            "attach",
            "42",
            "--break",
            "0x1000",
            "--watch",
            "0x2000:4",
        ]);
        let config = session_config(&cli.session).unwrap();
        assert_eq!(config.load_base, 0x1_0000_0000);
        assert_eq!(config.death_poll_interval, Duration::from_millis(50));
        assert!(!config.refresh_threads_on_trap);
        match cli.command {
            Commands::Attach {
                pid,
                breakpoints,
                watchpoints,
                ..
            } => {
                assert_eq!(pid, 42);
                assert_eq!(breakpoints, vec![0x1000]);
                assert_eq!(watchpoints, vec![(0x2000, 4)]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_demo_runs_against_simulated_target()
    {
        demo(SessionConfig::default().with_death_poll_interval(Duration::from_millis(10))).unwrap();
    }
}
