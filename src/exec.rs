use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// 外部命令执行结果
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout 与 stderr 合并后的内容
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }
}

/// 外部命令执行错误
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// 命令执行器 - nft 与 systemctl 调用都经过这里，测试中替换为桩实现
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        deadline: Duration,
    ) -> Result<CommandOutput, ExecError>;
}

/// 基于 tokio::process 的默认执行器
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        deadline: Duration,
    ) -> Result<CommandOutput, ExecError> {
        debug!("exec: {} {}", program, args.join(" "));

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        let output = match timeout(deadline, command.output()).await {
            Ok(result) => result.map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    program: program.to_string(),
                    timeout: deadline,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }
}

/// 把 &str 参数列表转换成 owned 形式
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}

/// 测试用的桩执行器：记录调用并按闭包返回结果
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&str, &[String]) -> Result<CommandOutput, ExecError> + Send + Sync>;

    pub struct StubRunner {
        calls: Mutex<Vec<String>>,
        responder: Responder,
    }

    impl StubRunner {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&str, &[String]) -> Result<CommandOutput, ExecError> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(|_, _| Ok(CommandOutput::ok("")))
        }

        /// 已执行的命令行，形如 "systemctl daemon-reload"
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            _deadline: Duration,
        ) -> Result<CommandOutput, ExecError> {
            let mut line = program.to_string();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            self.calls.lock().unwrap().push(line);
            (self.responder)(program, args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner;
        let out = runner
            .run("sh", &args(["-c", "echo hello; echo oops >&2; exit 3"]), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner;
        let err = runner
            .run("sleep", &args(["5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemRunner;
        let err = runner
            .run("/nonexistent/definitely-not-here", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
