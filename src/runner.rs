use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::{ProcessSpec, spawn_and_stream};

/// Pipeline phase an agent run belongs to; drives the log prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTask {
    Phase(String),
    Review,
    Fix,
    Build,
    Summarize,
    BatchGroup,
    BatchValidate,
    Recovery,
}

impl fmt::Display for AgentTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentTask::Phase(name) => write!(f, "{name}"),
            AgentTask::Review => write!(f, "review"),
            AgentTask::Fix => write!(f, "fix"),
            AgentTask::Build => write!(f, "build"),
            AgentTask::Summarize => write!(f, "summarize"),
            AgentTask::BatchGroup => write!(f, "batch-group"),
            AgentTask::BatchValidate => write!(f, "batch-validate"),
            AgentTask::Recovery => write!(f, "recovery"),
        }
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Opaque LLM agent boundary: consumes a prompt, produces streamed text.
pub trait AgentRunner: Send + Sync {
    fn run(
        &self,
        task: AgentTask,
        prompt: &str,
        working_dir: &Path,
    ) -> impl std::future::Future<Output = Result<RunResult>> + Send;
}

/// Runner invoking the claude CLI in non-interactive mode.
pub struct ClaudeRunner {
    agent_binary: String,
    model: Option<String>,
    thinking: Option<String>,
    timeout: Option<Duration>,
}

impl ClaudeRunner {
    pub fn new(
        agent_binary: String,
        model: Option<String>,
        thinking: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            agent_binary,
            model,
            thinking,
            timeout,
        }
    }

    /// Variant pinned to a cheap model for compaction summaries.
    pub fn summarizer(agent_binary: String, model: String, timeout: Duration) -> Self {
        Self {
            agent_binary,
            model: Some(model),
            thinking: None,
            timeout: Some(timeout),
        }
    }

    /// Build the command and arguments for a prompt.
    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(ref thinking) = self.thinking {
            args.push("--thinking".to_string());
            args.push(thinking.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.agent_binary.clone(), args)
    }
}

impl AgentRunner for ClaudeRunner {
    async fn run(&self, task: AgentTask, prompt: &str, working_dir: &Path) -> Result<RunResult> {
        let (command, args) = self.build_command(prompt);

        let spec = ProcessSpec {
            command,
            args,
            working_dir: working_dir.to_path_buf(),
            timeout: self.timeout,
            log_prefix: format!("agent:{task}"),
            env: vec![],
            stdin_data: None,
        };

        let output = spawn_and_stream(spec).await?;

        if let Some(sig) = output.signal {
            return Err(Error::AgentRunner(format!("agent killed by signal {sig}")));
        }
        if output.exit_code != 0 {
            return Err(Error::AgentRunner(format!(
                "agent exited with code {}",
                output.exit_code
            )));
        }

        Ok(RunResult {
            exit_code: output.exit_code,
            stdout: output.stdout(),
            stderr: output.stderr(),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted runner for tests: pops canned results, records prompts.
    pub struct ScriptedRunner {
        results: Mutex<Vec<Result<RunResult>>>,
        pub prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedRunner {
        pub fn new(results: Vec<Result<RunResult>>) -> Self {
            Self {
                results: Mutex::new(results),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(stdout: &str) -> Result<RunResult> {
            Ok(RunResult {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    impl AgentRunner for ScriptedRunner {
        async fn run(
            &self,
            task: AgentTask,
            prompt: &str,
            _working_dir: &Path,
        ) -> Result<RunResult> {
            self.prompts
                .lock()
                .unwrap()
                .push((task.to_string(), prompt.to_string()));
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Err(Error::AgentRunner("no more scripted results".into()))
            } else {
                results.remove(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_defaults() {
        let runner = ClaudeRunner::new("claude".to_string(), None, None, None);
        let (cmd, args) = runner.build_command("do something");
        assert_eq!(cmd, "claude");
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.contains(&"do something".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--thinking".to_string()));
    }

    #[test]
    fn test_build_command_with_model_and_thinking() {
        let runner = ClaudeRunner::new(
            "claude".to_string(),
            Some("opus".to_string()),
            Some("high".to_string()),
            None,
        );
        let (_cmd, args) = runner.build_command("plan");
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"opus".to_string()));
        assert!(args.contains(&"--thinking".to_string()));
        assert!(args.contains(&"high".to_string()));
    }

    #[test]
    fn test_summarizer_pins_model() {
        let runner =
            ClaudeRunner::summarizer("claude".into(), "haiku".into(), Duration::from_secs(60));
        let (_cmd, args) = runner.build_command("summarize this");
        assert!(args.contains(&"haiku".to_string()));
    }

    #[test]
    fn test_agent_task_display() {
        assert_eq!(
            AgentTask::Phase("discovery".to_string()).to_string(),
            "discovery"
        );
        assert_eq!(AgentTask::Review.to_string(), "review");
        assert_eq!(AgentTask::BatchValidate.to_string(), "batch-validate");
    }

    #[tokio::test]
    async fn test_scripted_runner_pops_in_order() {
        use testing::ScriptedRunner;
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::ok("first"),
            ScriptedRunner::ok("second"),
        ]);
        let a = runner
            .run(AgentTask::Review, "p1", Path::new("/tmp"))
            .await
            .unwrap();
        let b = runner
            .run(AgentTask::Fix, "p2", Path::new("/tmp"))
            .await
            .unwrap();
        assert_eq!(a.stdout, "first");
        assert_eq!(b.stdout, "second");
        assert!(runner.run(AgentTask::Fix, "p3", Path::new("/tmp")).await.is_err());
    }
}
