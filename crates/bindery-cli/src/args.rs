//! Command-line parsing.

use std::path::PathBuf;

use anyhow::{Context, bail};

use bindery_core::domain::{JobFilter, JobId, JobStatus, Step};

pub const USAGE: &str = "\
usage: bindery <command> [args]

commands:
  migrate                         create the job tables
  worker [--workers N] [--expect step,step]
                                  run workers (steps bound via BINDERY_STEP_<STEP>)
  enqueue <plan.json>             validate a plan and insert its jobs
  list [--book B] [--status S] [--step S] [--limit N]
  show <job-id>
  events <job-id>
  cancel <job-id>
  retry <job-id>
  delete <job-id>
  status                          job counts per status

environment:
  DATABASE_URL                    PostgreSQL connection string (required)
  RUST_LOG, BINDERY_LOG_FORMAT    logging";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Migrate,
    Worker {
        workers: Option<usize>,
        expect: Vec<Step>,
    },
    Enqueue {
        plan: PathBuf,
    },
    List(JobFilter),
    Show(JobId),
    Events(JobId),
    Cancel(JobId),
    Retry(JobId),
    Delete(JobId),
    Status,
}

pub fn parse<I, S>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::into);
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "help" | "-h" | "--help" => Ok(Command::Help),
        "migrate" => no_args("migrate", &rest).map(|_| Command::Migrate),
        "status" => no_args("status", &rest).map(|_| Command::Status),
        "worker" => parse_worker(&rest),
        "enqueue" => Ok(Command::Enqueue {
            plan: PathBuf::from(single("enqueue", &rest)?),
        }),
        "list" => parse_list(&rest).map(Command::List),
        "show" => job_id("show", &rest).map(Command::Show),
        "events" => job_id("events", &rest).map(Command::Events),
        "cancel" => job_id("cancel", &rest).map(Command::Cancel),
        "retry" => job_id("retry", &rest).map(Command::Retry),
        "delete" => job_id("delete", &rest).map(Command::Delete),
        other => bail!("unknown command: {other}\n\n{USAGE}"),
    }
}

fn no_args(command: &str, rest: &[String]) -> anyhow::Result<()> {
    if !rest.is_empty() {
        bail!("{command} takes no arguments");
    }
    Ok(())
}

fn single<'a>(command: &str, rest: &'a [String]) -> anyhow::Result<&'a str> {
    match rest {
        [one] => Ok(one),
        _ => bail!("{command} takes exactly one argument"),
    }
}

fn job_id(command: &str, rest: &[String]) -> anyhow::Result<JobId> {
    let raw = single(command, rest)?;
    raw.parse().with_context(|| format!("invalid job id: {raw}"))
}

/// `--flag value` pairs.
fn flags(rest: &[String]) -> anyhow::Result<Vec<(&str, &str)>> {
    let mut pairs = Vec::new();
    let mut iter = rest.iter();
    while let Some(flag) = iter.next() {
        if !flag.starts_with("--") {
            bail!("unexpected argument: {flag}");
        }
        let value = iter
            .next()
            .with_context(|| format!("{flag} needs a value"))?;
        pairs.push((flag.as_str(), value.as_str()));
    }
    Ok(pairs)
}

fn parse_worker(rest: &[String]) -> anyhow::Result<Command> {
    let mut workers = None;
    let mut expect = Vec::new();
    for (flag, value) in flags(rest)? {
        match flag {
            "--workers" => {
                let n: usize = value
                    .parse()
                    .with_context(|| format!("--workers: not a number: {value}"))?;
                if n == 0 {
                    bail!("--workers must be at least 1");
                }
                workers = Some(n);
            }
            "--expect" => expect.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Step::from),
            ),
            other => bail!("unknown worker flag: {other}"),
        }
    }
    Ok(Command::Worker { workers, expect })
}

fn parse_list(rest: &[String]) -> anyhow::Result<JobFilter> {
    let mut filter = JobFilter::default();
    for (flag, value) in flags(rest)? {
        match flag {
            "--book" => filter.book_id = Some(value.to_string()),
            "--status" => {
                let status: JobStatus = value
                    .parse()
                    .with_context(|| format!("--status: {value}"))?;
                filter = filter.with_status(status);
            }
            "--step" => filter = filter.with_step(Step::from(value)),
            "--limit" => {
                let n: usize = value
                    .parse()
                    .with_context(|| format!("--limit: not a number: {value}"))?;
                filter = filter.with_limit(n);
            }
            other => bail!("unknown list flag: {other}"),
        }
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn no_arguments_prints_help() {
        assert_eq!(parse(Vec::<String>::new()).unwrap(), Command::Help);
    }

    #[test]
    fn worker_flags() {
        let cmd = parse(["worker", "--workers", "4", "--expect", "render_pdf, package"]).unwrap();
        assert_eq!(
            cmd,
            Command::Worker {
                workers: Some(4),
                expect: vec![Step::RenderPdf, Step::Package],
            }
        );
    }

    #[test]
    fn list_filters() {
        let cmd = parse(["list", "--book", "vth-n4", "--status", "failed", "--limit", "20"]).unwrap();
        let Command::List(filter) = cmd else {
            panic!("expected list");
        };
        assert_eq!(filter.book_id.as_deref(), Some("vth-n4"));
        assert_eq!(filter.status, Some(JobStatus::Failed));
        assert_eq!(filter.limit, Some(20));
    }

    #[test]
    fn job_commands_take_an_id() {
        let id = "job-01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let Command::Show(parsed) = parse(["show", id]).unwrap() else {
            panic!("expected show");
        };
        assert_eq!(parsed.to_string(), id);
    }

    #[rstest]
    #[case(&["frobnicate"])]
    #[case(&["show"])]
    #[case(&["show", "not-an-id"])]
    #[case(&["worker", "--workers", "0"])]
    #[case(&["worker", "--workers"])]
    #[case(&["list", "--status", "sleeping"])]
    #[case(&["status", "extra"])]
    fn bad_invocations_are_rejected(#[case] args: &[&str]) {
        assert!(parse(args.iter().copied()).is_err());
    }
}
