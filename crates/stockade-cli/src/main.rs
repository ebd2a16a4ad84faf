//! stockade CLI - run a program under a syscall policy

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stockade_core::policy::config::PolicyFile;
use stockade_core::{DefaultAction, ExecutionResult, Executor, FinalStatus, Limits, Policy, Sandbox};

#[derive(Parser)]
#[command(name = "stockade")]
#[command(author, version, about = "Run programs under a seccomp policy with a ptrace monitor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program in the sandbox and print the result as JSON
    Run {
        /// JSON policy file; without one every syscall is allowed
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Wall-time limit in seconds (0 for none)
        #[arg(short, long, default_value = "0")]
        timeout: u64,

        /// CPU-time limit in seconds
        #[arg(long)]
        cpu: Option<u64>,

        /// Address-space limit in MB
        #[arg(short, long)]
        memory: Option<u64>,

        /// Working directory of the sandboxee
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variables, KEY=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Start with an empty environment
        #[arg(long)]
        clear_env: bool,

        /// Let the program install the policy itself over the comms channel
        #[arg(long)]
        cooperative: bool,

        /// Program and its arguments
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Validate a policy file and show its compiled size
    Check {
        policy: PathBuf,

        /// Print the compiled program
        #[arg(long)]
        dump: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stockade=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            policy,
            timeout,
            cpu,
            memory,
            cwd,
            env,
            clear_env,
            cooperative,
            command,
        } => {
            let policy = match policy {
                Some(path) => load_policy(&path)?,
                None => Policy::builder()
                    .default_action(DefaultAction::AllowAllSyscalls)
                    .build()?,
            };

            let mut limits = Limits::default().walltime(Duration::from_secs(timeout));
            if let Some(secs) = cpu {
                limits = limits.cpu_time_secs(secs);
            }
            if let Some(mb) = memory {
                limits = limits.address_space_mb(mb);
            }

            let (program, _) = command.split_first().context("no program given")?;
            let mut executor = Executor::new(program, &command)
                .limits(limits)
                .enable_sandbox_before_exec(!cooperative);
            if clear_env {
                executor = executor.env(std::iter::empty::<(String, String)>());
            }
            for var in &env {
                let Some((key, value)) = var.split_once('=') else {
                    bail!("environment variable {var:?} is not KEY=VALUE");
                };
                executor = executor.env_var(key, value);
            }
            if let Some(dir) = cwd {
                executor = executor.cwd(dir);
            }

            let sandbox = Arc::new(Sandbox::new(executor, policy));
            forward_termination(&sandbox)?;

            let result = sandbox.run();
            println!("{}", serde_json::to_string_pretty(&result)?);
            std::process::exit(exit_code(&result));
        }

        Commands::Check { policy, dump } => {
            let compiled = load_policy(&policy)?;
            println!(
                "{}: {} rules, {} instructions",
                policy.display(),
                compiled.rules().len(),
                compiled.program().len()
            );
            if dump {
                for (i, insn) in compiled.program().iter().enumerate() {
                    println!(
                        "{i:4}: code={:#06x} jt={:3} jf={:3} k={:#010x}",
                        insn.code, insn.jt, insn.jf, insn.k
                    );
                }
            }
        }
    }

    Ok(())
}

fn load_policy(path: &std::path::Path) -> anyhow::Result<Policy> {
    PolicyFile::load(path)
        .and_then(|file| file.build())
        .with_context(|| format!("invalid policy {}", path.display()))
}

/// Turn SIGINT/SIGTERM into a sandbox kill
fn forward_termination(sandbox: &Arc<Sandbox>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let sandbox = Arc::clone(sandbox);
    std::thread::Builder::new()
        .name("stockade-signals".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                tracing::info!(signal = sig, "terminating sandboxee");
                sandbox.kill();
            }
        })?;
    Ok(())
}

/// Shell-style exit code for a result
fn exit_code(result: &ExecutionResult) -> i32 {
    match result.final_status() {
        FinalStatus::Ok => i32::try_from(result.reason_code()).unwrap_or(1),
        FinalStatus::Signaled => 128 + i32::try_from(result.reason_code()).unwrap_or(0),
        FinalStatus::Violation => 159,
        FinalStatus::Timeout => 124,
        FinalStatus::ExternalKill => 137,
        FinalStatus::SetupError => 125,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_trailing_args() {
        let cli = Cli::try_parse_from([
            "stockade", "run", "-t", "5", "--env", "A=b", "/bin/echo", "-n", "hi",
        ])
        .unwrap();
        let Commands::Run {
            timeout,
            env,
            command,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(timeout, 5);
        assert_eq!(env, ["A=b"]);
        assert_eq!(command, ["/bin/echo", "-n", "hi"]);
    }

    #[test]
    fn run_requires_a_program() {
        assert!(Cli::try_parse_from(["stockade", "run"]).is_err());
    }
}
