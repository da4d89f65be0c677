#![deny(clippy::all)]

use anyhow::Context;
use basecode::compiler::{Session, SessionOptions, SessionPhase};
use std::{path::PathBuf, process};
use structopt::StructOpt;

/// The sub-command to execute.
#[derive(Debug, StructOpt)]
enum Command {
    /// Compile source code without executing it.
    #[structopt(name = "compile")]
    Compile {
        #[structopt(flatten)]
        common: CommonOpts,
    },

    /// Compile and execute source code.
    #[structopt(name = "run")]
    Run {
        #[structopt(flatten)]
        common: CommonOpts,
    },
}

#[derive(Debug, StructOpt)]
struct CommonOpts {
    /// VM heap size, in bytes
    #[structopt(long = "heap-size", default_value = "2097152")]
    heap_size: usize,

    /// VM stack size, in bytes
    #[structopt(long = "stack-size", default_value = "65536")]
    stack_size: usize,

    /// Print the assembly listing and compile phases
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Write the program's element graph to this DOT file
    #[structopt(parse(from_os_str), long = "dot-graph")]
    dom_graph_file: Option<PathBuf>,

    /// Emit diagnostics as JSON instead of plain text
    #[structopt(long = "json")]
    json: bool,

    /// Source files, compiled in order; the first is the root module
    #[structopt(parse(from_os_str), required = true)]
    source_paths: Vec<PathBuf>,
}

/// Basecode executable, for compiling and executing Basecode programs
#[derive(Debug, StructOpt)]
#[structopt(name = "basecode")]
struct Opt {
    #[structopt(subcommand)]
    cmd: Command,
}

fn build_session(common: &CommonOpts) -> anyhow::Result<Session> {
    let verbose = common.verbose;
    let mut options = SessionOptions {
        heap_size: common.heap_size,
        stack_size: common.stack_size,
        verbose,
        output_ast_graphs: common.dom_graph_file.is_some(),
        dom_graph_file: common.dom_graph_file.clone(),
        compile_callback: None,
    };
    if verbose {
        options.compile_callback = Some(Box::new(|phase, path| {
            let phase = match phase {
                SessionPhase::Start => "start",
                SessionPhase::Success => "success",
                SessionPhase::Failed => "failed",
            };
            eprintln!("[{}] {}", phase, path.display());
        }));
    }

    let mut session = Session::new(options);
    for path in &common.source_paths {
        session.add_source_file(path).with_context(|| {
            format!("Failed to read source file {:?}", path)
        })?;
    }
    Ok(session)
}

fn report(session: &Session, json: bool) -> anyhow::Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(session.result().messages())?,
        );
    } else {
        for message in session.result().messages() {
            eprintln!("{}", message);
        }
    }
    Ok(())
}

fn run(opt: Opt) -> anyhow::Result<i32> {
    match opt.cmd {
        Command::Compile { common } => {
            let mut session = build_session(&common)?;
            let ok = session.compile();
            report(&session, common.json)?;
            if ok && common.verbose {
                print!("{}", session.assembler().listing());
            }
            Ok(if ok { 0 } else { 1 })
        }
        Command::Run { common } => {
            let mut session = build_session(&common)?;
            if !session.compile() {
                report(&session, common.json)?;
                return Ok(1);
            }
            if common.verbose {
                print!("{}", session.assembler().listing());
            }
            let ok = session.run();
            report(&session, common.json)?;
            Ok(if ok { 0 } else { 1 })
        }
    }
}

fn main() {
    let exit_code = match run(Opt::from_args()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
