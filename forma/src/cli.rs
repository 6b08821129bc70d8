use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Forma - text-to-CAD agent with a sandboxed build123d executor
#[derive(Parser, Debug)]
#[command(name = "forma")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the A2A HTTP gateway
    Serve {
        /// Listen address (default: FORMA_BIND_ADDR or 0.0.0.0:8000)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Generate a model from a prompt, streaming progress to the terminal
    Run {
        /// Natural-language description of the part
        #[arg(value_name = "PROMPT")]
        prompt: String,

        /// Session id shared across runs (conversation memory)
        #[arg(long)]
        session: Option<String>,

        /// Maximum coder iterations (default: FORMA_MAX_ITERATIONS or 3)
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Print iteration markers
        #[arg(short, long)]
        verbose: bool,
    },

    /// Statically validate a script without running it
    Validate {
        /// Path to the Python script
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Validate and execute a script in the sandbox, exporting STL and STEP
    Exec {
        /// Path to the Python script
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Task id used to name the artifacts
        #[arg(long, default_value = "cli")]
        task_id: String,

        /// Execution timeout in seconds (default: FORMA_EXEC_TIMEOUT_SECS or 120)
        #[arg(long)]
        timeout: Option<u64>,

        /// Memory limit in MB (default: FORMA_MAX_MEMORY_MB or 2048)
        #[arg(long)]
        max_memory: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["forma", "run", "a 10 cm cube", "--max-iterations", "2"]).unwrap();
        match cli.command {
            Commands::Run {
                prompt,
                max_iterations,
                verbose,
                session,
            } => {
                assert_eq!(prompt, "a 10 cm cube");
                assert_eq!(max_iterations, Some(2));
                assert!(!verbose);
                assert!(session.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_exec_defaults() {
        let cli = Cli::try_parse_from(["forma", "exec", "part.py"]).unwrap();
        match cli.command {
            Commands::Exec { file, task_id, timeout, .. } => {
                assert_eq!(file, PathBuf::from("part.py"));
                assert_eq!(task_id, "cli");
                assert!(timeout.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_command_required() {
        assert!(Cli::try_parse_from(["forma"]).is_err());
    }
}
