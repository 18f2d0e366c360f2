//! CommandExecutor - step を外部プログラムに委譲する StepExecutor
//!
//! `BINDERY_STEP_<STEP>=<program> [args...]` binds a step to a program.
//! The program receives the job as JSON on stdin and prints a JSON
//! `StepOutcome` on stdout. A non-zero exit fails the job with the tail of
//! stderr; exit code 75 (`EX_TEMPFAIL`) marks the failure transient.

use std::ffi::OsString;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use bindery_core::domain::{Job, Step, StepError, StepOutcome, WorkerId};
use bindery_core::ports::StepExecutor;

pub const STEP_ENV_PREFIX: &str = "BINDERY_STEP_";

const EX_TEMPFAIL: i32 = 75;
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse `program arg1 arg2` (whitespace separated, no quoting).
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    async fn execute(&self, job: &Job, worker: &WorkerId) -> Result<StepOutcome, StepError> {
        let payload = serde_json::to_vec(job)
            .map_err(|e| StepError::permanent(format!("encode job for {}: {e}", self.program)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("BINDERY_JOB_ID", job.id.to_string())
            .env("BINDERY_WORKER_ID", worker.as_str())
            .env("BINDERY_STEP", job.step.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::permanent(format!("failed to spawn {}: {e}", self.program)))?;

        // stdout を読みながら stdin に書く（大きな出力でのデッドロック回避）
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let written = stdin.write_all(&payload).await;
                drop(stdin);
                written
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StepError::transient(format!("wait for {}: {e}", self.program)))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // the program may exit without reading stdin; its exit status decides
                Ok(Err(e)) => tracing::debug!(program = %self.program, error = %e, "stdin not fully written"),
                Err(e) => tracing::debug!(program = %self.program, error = %e, "stdin writer aborted"),
            }
        }

        parse_output(output.status.code(), &output.stdout, &output.stderr)
    }
}

/// Map a finished process to an outcome.
pub(crate) fn parse_output(
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<StepOutcome, StepError> {
    match code {
        Some(0) => serde_json::from_slice::<StepOutcome>(stdout).map_err(|e| {
            StepError::permanent(format!("invalid outcome on stdout: {e}"))
        }),
        Some(code) => {
            let message = format!("exited with status {code}: {}", stderr_tail(stderr));
            if code == EX_TEMPFAIL {
                Err(StepError::transient(message))
            } else {
                Err(StepError::permanent(message))
            }
        }
        None => Err(StepError::transient(format!(
            "terminated by signal: {}",
            stderr_tail(stderr)
        ))),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - STDERR_TAIL_CHARS).collect();
    format!("…{tail}")
}

/// `BINDERY_STEP_RENDER_PDF` -> `render_pdf`
pub fn step_from_env_key(key: &str) -> Option<Step> {
    let name = key.strip_prefix(STEP_ENV_PREFIX)?;
    if name.is_empty() {
        return None;
    }
    Some(Step::from(name.to_ascii_lowercase().as_str()))
}

/// Environment entries that are valid UTF-8; anything else is skipped.
pub fn utf8_vars(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> impl Iterator<Item = (String, String)> {
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

/// Every `BINDERY_STEP_*` binding in `vars`.
pub fn executors_from_vars(
    vars: impl IntoIterator<Item = (String, String)>,
) -> Vec<(Step, CommandExecutor)> {
    let mut bindings: Vec<(Step, CommandExecutor)> = vars
        .into_iter()
        .filter_map(|(key, value)| Some((step_from_env_key(&key)?, CommandExecutor::parse(&value)?)))
        .collect();
    bindings.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    bindings
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use bindery_core::domain::{Artifacts, ErrorKind};

    #[test]
    fn done_outcome_is_parsed() {
        let out = br#"{"status":"done","outputs":{"pdf":"out/vth-n4.pdf"}}"#;
        let outcome = parse_output(Some(0), out, b"").unwrap();
        assert_eq!(
            outcome,
            StepOutcome::done(Artifacts::from([("pdf".into(), "out/vth-n4.pdf".into())]))
        );
    }

    #[test]
    fn yield_outcome_is_parsed() {
        let out = br#"{"status":"yield","next_inputs":{"cursor":"7"},"progress":40,"message":"page 7"}"#;
        let outcome = parse_output(Some(0), out, b"").unwrap();
        assert!(outcome.is_yield());
        assert_eq!(
            outcome,
            StepOutcome::yield_with(Artifacts::from([("cursor".into(), "7".into())]))
                .with_progress(40)
                .with_message("page 7")
        );
    }

    #[rstest]
    #[case::tempfail(Some(75), ErrorKind::Transient)]
    #[case::plain_failure(Some(1), ErrorKind::Permanent)]
    #[case::signal(None, ErrorKind::Transient)]
    fn exit_status_classifies_failure(#[case] code: Option<i32>, #[case] kind: ErrorKind) {
        let err = parse_output(code, b"", b"latex: missing font\n").unwrap_err();
        assert_eq!(err.kind(), kind);
        assert!(err.message().contains("latex: missing font"));
    }

    #[test]
    fn garbage_on_stdout_is_permanent() {
        let err = parse_output(Some(0), b"rendering...", b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.message().starts_with("invalid outcome on stdout"));
    }

    #[test]
    fn stderr_is_cut_to_its_tail() {
        let long = format!("{}END", "x".repeat(2000));
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with('…'));
        assert!(tail.ends_with("END"));
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS + 1);
    }

    #[test]
    fn env_bindings_map_to_steps() {
        let vars = vec![
            ("BINDERY_STEP_RENDER_PDF".to_string(), "typeset --pdf".to_string()),
            ("BINDERY_STEP_TRANSLATE".to_string(), "translate.sh".to_string()),
            ("BINDERY_STEP_".to_string(), "ignored".to_string()),
            ("BINDERY_STEP_VALIDATE".to_string(), "   ".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let bindings = executors_from_vars(vars);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].0, Step::RenderPdf);
        assert_eq!(
            bindings[0].1,
            CommandExecutor::new("typeset", vec!["--pdf".to_string()])
        );
        assert_eq!(bindings[1].0, Step::from("translate"));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_environment_entries_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (
                OsString::from("BINDERY_STEP_PACKAGE"),
                OsString::from("zip -r"),
            ),
            (
                OsString::from("BINDERY_STEP_VALIDATE"),
                OsString::from_vec(vec![b'c', 0xff, b'k']),
            ),
            (OsString::from_vec(vec![0xfe, b'X']), OsString::from("1")),
        ];
        let bindings = executors_from_vars(utf8_vars(vars));
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].0, Step::Package);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_a_real_program() {
        use bindery_core::domain::NewJob;
        use bindery_core::impls::InMemoryJobStore;
        use bindery_core::ports::JobStore;

        let job = InMemoryJobStore::new()
            .insert_job(NewJob::new("vth-n4", Step::Package))
            .await
            .unwrap();
        let exec = CommandExecutor::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo '{"status":"done","outputs":{"zip":"out/book.zip"}}'"#
                    .to_string(),
            ],
        );
        let outcome = exec.execute(&job, &WorkerId::new("w1")).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::done(Artifacts::from([("zip".into(), "out/book.zip".into())]))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tempfail_exit_is_transient() {
        use bindery_core::domain::NewJob;
        use bindery_core::impls::InMemoryJobStore;
        use bindery_core::ports::JobStore;

        let job = InMemoryJobStore::new()
            .insert_job(NewJob::new("vth-n4", Step::Rewrite))
            .await
            .unwrap();
        let exec = CommandExecutor::new(
            "sh",
            vec!["-c".to_string(), "echo 'rate limited' >&2; exit 75".to_string()],
        );
        let err = exec.execute(&job, &WorkerId::new("w1")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.message(), "exited with status 75: rate limited");
    }

    #[tokio::test]
    async fn missing_program_is_permanent() {
        use bindery_core::domain::NewJob;
        use bindery_core::impls::InMemoryJobStore;
        use bindery_core::ports::JobStore;

        let job = InMemoryJobStore::new()
            .insert_job(NewJob::new("vth-n4", Step::Rewrite))
            .await
            .unwrap();
        let exec = CommandExecutor::new("bindery-no-such-program", Vec::new());
        let err = exec.execute(&job, &WorkerId::new("w1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
