use anyhow::{Context, Result};
use childmux::config::Config;
use childmux::process::{Channel, ChannelFlags, Launcher, ProcessContext, ProcessController};
use childmux::reactor::Reactor;
use clap::Parser;
use std::cell::Cell;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "childmux")]
#[command(about = "Run a program and relay its output through a non-blocking reactor", long_about = None)]
struct Args {
    /// Working directory for the program
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Replace the program's environment with KEY=VALUE entries (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Text written to the program's stdin, which is then closed
    #[arg(long)]
    input: Option<String>,

    /// Capture and relay stderr as well as stdout
    #[arg(long)]
    stderr: bool,

    /// Relay output line by line
    #[arg(long)]
    lines: bool,

    /// Start the program detached and print its pid
    #[arg(long)]
    detach: bool,

    /// Configuration file to use instead of the default locations
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log engine activity to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Program and its arguments
    #[arg(required = true, trailing_var_arg = true, num_args = 1.., value_name = "PROGRAM")]
    command: Vec<OsString>,
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = if verbose { "debug" } else { config.log.filter.as_str() };
        EnvFilter::new(directive)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load(),
    };
    init_logging(&config, args.verbose);

    let env_override = (!args.env.is_empty()).then_some(args.env.as_slice());

    if args.detach {
        let mut launcher = Launcher::new(args.command[0].clone()).args(&args.command[1..]);
        if let Some(dir) = &args.cwd {
            launcher = launcher.working_dir(dir);
        }
        if let Some(env) = env_override {
            launcher = launcher.env_override(env.to_vec());
        }
        let pid = launcher.spawn_with(&config.engine)?;
        println!("{pid}");
        return Ok(());
    }

    let code = run_attached(&args, &config, env_override)?;
    std::process::exit(code);
}

fn run_attached(args: &Args, config: &Config, env_override: Option<&[String]>) -> Result<i32> {
    let reactor = Reactor::new();
    let ctx = ProcessContext::new(reactor.clone(), config.engine.clone());
    let controller = ProcessController::new(&ctx);

    let mut channels = ChannelFlags::STDOUT;
    if args.stderr {
        channels |= ChannelFlags::STDERR;
    }
    if args.input.is_some() {
        channels |= ChannelFlags::STDIN;
    }
    controller.configure(args.command.iter().cloned(), args.cwd.clone(), channels, 0, 1);

    let lines = args.lines;
    controller.on_output_ready(Channel::Stdout, move |c, ch| relay(c, ch, lines));
    if args.stderr {
        controller.on_output_ready(Channel::Stderr, move |c, ch| relay(c, ch, lines));
    }

    let exited = Rc::new(Cell::new(false));
    let flag = Rc::clone(&exited);
    controller.on_exited(move |_| flag.set(true));

    controller.start(env_override)?;
    debug!(pid = ?controller.pid(), "program started");

    if let Some(input) = &args.input {
        controller.on_write_flushed(Channel::Stdin, |c, ch| c.close_channel(ch));
        controller.write(Channel::Stdin, input.as_bytes());
        if input.is_empty() {
            controller.close_channel(Channel::Stdin);
        }
    }

    while !exited.get() {
        reactor.turn(None).context("Event loop failed")?;
    }

    relay(&controller, Channel::Stdout, lines);
    if args.stderr {
        relay(&controller, Channel::Stderr, lines);
    }

    let code = if controller.normal_exit() {
        controller.exit_status()
    } else if let Some(signal) = controller.exit_signal() {
        128 + signal as i32
    } else {
        1
    };
    Ok(code)
}

/// Copy what the channel has buffered to our own stdout or stderr
fn relay(controller: &ProcessController, channel: Channel, lines: bool) {
    let result = if channel == Channel::Stderr {
        copy_out(controller, channel, lines, &mut io::stderr().lock())
    } else {
        copy_out(controller, channel, lines, &mut io::stdout().lock())
    };
    if let Err(e) = result {
        warn!(%channel, error = %e, "failed to relay output");
    }
}

fn copy_out(
    controller: &ProcessController,
    channel: Channel,
    lines: bool,
    out: &mut impl Write,
) -> io::Result<()> {
    if lines {
        while let Some(line) = controller.read_line(channel) {
            out.write_all(&line)?;
            out.write_all(b"\n")?;
        }
    } else {
        out.write_all(&controller.read(channel))?;
    }
    out.flush()
}
