use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tracing::{debug, trace, warn};

use crate::config::ProgramsConfig;
use crate::error::Error;


/// Opaque per-step options, passed through from the submitter.
pub type Options = serde_json::Map<String, serde_json::Value>;


#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    Badblocks,
    Wget,
}

impl Program {
    pub fn name(&self) -> &'static str {
        match self {
            Program::Badblocks => "badblocks",
            Program::Wget => "wget",
        }
    }

    /// Builds the process invocation for this program against `resource`.
    pub fn invocation(
        &self,
        resource: &str,
        options: &Options,
        programs: &ProgramsConfig
    ) -> Result<Invocation, Error> {
        match self {
            Program::Badblocks => Invocation::from_prefix(&programs.badblocks, [
                "-w", "-s", "-p", "0", "-t", "0x00", "-b", "4096", resource,
            ]),
            Program::Wget => {
                let url = options.get("url")
                    .and_then(|url| url.as_str())
                    .unwrap_or(&programs.download_url);
                Invocation::from_prefix(&programs.wget, ["-O", "/dev/null", url])
            }
        }
    }

    /// Extracts the latest percentage from a chunk of this program's output.
    pub fn parse_progress(&self, output: &str) -> Option<f64> {
        self.last_progress(output).map(|(percentage, _)| percentage)
    }

    /// The latest percentage in `output` and the offset just past it.
    fn last_progress(&self, output: &str) -> Option<(f64, usize)> {
        let pattern = match self {
            Program::Badblocks => badblocks_pattern(),
            Program::Wget => wget_pattern(),
        };

        pattern.captures_iter(output)
            .filter_map(|captures| {
                let end = captures.get(0)?.end();
                Some((captures[1].parse().ok()?, end))
            })
            .last()
    }
}

impl FromStr for Program {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "badblocks" => Ok(Program::Badblocks),
            "wget" => Ok(Program::Wget),
            _ => Err(Error::UnknownProgram(name.to_string())),
        }
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(self.name())
    }
}


fn badblocks_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)%\s*done").expect("valid badblocks pattern")
    })
}


fn wget_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid wget pattern")
    })
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Splits a shell-style command prefix and appends `args` to it.
    pub fn from_prefix<I, S>(prefix: &str, args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut words = shlex::split(prefix).unwrap_or_default().into_iter();
        let program = words.next()
            .ok_or_else(|| Error::Config(format!("invalid command: {:?}", prefix)))?;

        Ok(Self {
            program,
            args: words.chain(args.into_iter().map(Into::into)).collect(),
        })
    }
}


/// Longest unmatched output kept between reads.
const MAX_CARRY: usize = 64;


/// Finds percentages in one output stream. A token split across reads is
/// completed by the next chunk.
#[derive(Debug)]
struct ProgressScanner {
    program: Program,
    carry: String,
}

impl ProgressScanner {
    fn new(program: Program) -> Self {
        Self { program, carry: String::new() }
    }

    fn feed(&mut self, chunk: &str) -> Option<f64> {
        self.carry.push_str(chunk);
        let found = self.program.last_progress(&self.carry);

        let mut rest = found.map_or(0, |(_, end)| end);
        if self.carry.len() - rest > MAX_CARRY {
            rest = self.carry.len() - MAX_CARRY;
            while !self.carry.is_char_boundary(rest) {
                rest += 1;
            }
        }
        self.carry.drain(..rest);

        found.map(|(percentage, _)| percentage)
    }
}


#[derive(Clone, Debug)]
pub enum CommandEvent {
    /// The process exists and owns the resource.
    Spawned,
    Update(f64),
    Done,
    Error(Error),
}


/// One external process invocation. Emits `Spawned`, any number of
/// `Update`s and then exactly one of `Done` or `Error`.
#[derive(Debug)]
pub struct Command {
    program: Program,
    invocation: Invocation,
    pid: Arc<AtomicU32>,
}

impl Command {
    pub fn new(program: Program, invocation: Invocation) -> Self {
        Self {
            program,
            invocation,
            pid: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Launches the process. Spawn failures are reported through `emit`.
    pub fn start<F>(&mut self, emit: F)
    where
        F: Fn(CommandEvent) + Send + Sync + 'static
    {
        let program = self.program;
        debug!(%program, command = ?self.invocation, "spawning process");

        let child = tokio::process::Command::new(&self.invocation.program)
            .args(&self.invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                emit(CommandEvent::Error(Error::SpawnFailed {
                    program,
                    source: Arc::new(err),
                }));
                return;
            }
        };

        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);
        emit(CommandEvent::Spawned);

        let pid = self.pid.clone();
        tokio::spawn(async move {
            let event = supervise(program, &mut child, &emit).await;
            pid.store(0, Ordering::SeqCst);
            emit(event);
        });
    }

    /// Asks the process to terminate. There is no follow-up kill.
    pub fn stop(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory safety requirements.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                warn!(program = %self.program, pid, "failed to signal process: {}",
                    std::io::Error::last_os_error());
            }
        }

        #[cfg(not(unix))]
        warn!(program = %self.program, pid, "stopping processes is not supported here");
    }
}


async fn supervise<F>(program: Program, child: &mut Child, emit: &F) -> CommandEvent
where
    F: Fn(CommandEvent) + Sync
{
    let read = read_progress(program, child.stdout.take(), child.stderr.take(), emit).await;

    let status = match child.wait().await {
        Ok(status) => status,
        Err(err) => {
            return CommandEvent::Error(Error::OutputFailed {
                program,
                source: Arc::new(err),
            });
        }
    };

    if let Err(err) = read {
        return CommandEvent::Error(Error::OutputFailed { program, source: Arc::new(err) });
    }

    match status.code() {
        Some(0) => CommandEvent::Done,
        Some(code) => CommandEvent::Error(Error::ExitFailure { program, code }),
        None => CommandEvent::Error(Error::Terminated { program }),
    }
}


/// Reads both output streams to the end, emitting every new percentage.
/// Progress is redrawn in place, so output is handled in raw chunks rather
/// than lines.
async fn read_progress<O, E, F>(
    program: Program,
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    emit: &F
) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    F: Fn(CommandEvent) + Sync
{
    let mut out_buf = [0u8; 1024];
    let mut err_buf = [0u8; 1024];
    let mut out_scanner = ProgressScanner::new(program);
    let mut err_scanner = ProgressScanner::new(program);
    let mut last = None;

    loop {
        let (source, read) = tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => {
                (Source::Stdout, read)
            }
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => {
                (Source::Stderr, read)
            }
            else => break,
        };

        let n = read?;
        if n == 0 {
            match source {
                Source::Stdout => stdout = None,
                Source::Stderr => stderr = None,
            }
            continue;
        }

        let (chunk, scanner) = match source {
            Source::Stdout => (&out_buf[..n], &mut out_scanner),
            Source::Stderr => (&err_buf[..n], &mut err_scanner),
        };
        let text = String::from_utf8_lossy(chunk);
        trace!(%program, output = %text, "process output");
        if let Some(percentage) = scanner.feed(&text) {
            if last != Some(percentage) {
                last = Some(percentage);
                emit(CommandEvent::Update(percentage));
            }
        }
    }

    Ok(())
}


enum Source {
    Stdout,
    Stderr,
}


async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> Invocation {
        Invocation { program: "sh".into(), args: vec!["-c".into(), script.into()] }
    }

    async fn run(program: Program, invocation: Invocation) -> Vec<CommandEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut command = Command::new(program, invocation);
        command.start(move |event| {
            let _ = tx.send(event);
        });

        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn program_names_are_a_closed_set() {
        assert_eq!("badblocks".parse::<Program>().unwrap(), Program::Badblocks);
        assert_eq!("wget".parse::<Program>().unwrap(), Program::Wget);
        assert!(matches!("dd".parse::<Program>(), Err(Error::UnknownProgram(name)) if name == "dd"));
    }

    #[test]
    fn parses_badblocks_progress() {
        let output = "Testing with pattern 0x00:  12.34% done, 0:05 elapsed. (0/0/0 errors)\
            \x08\x08\x08\x08 13.01% done, 0:06 elapsed. (0/0/0 errors)";
        assert_eq!(Program::Badblocks.parse_progress(output), Some(13.01));
        assert_eq!(Program::Badblocks.parse_progress("Checking for bad blocks"), None);
    }

    #[test]
    fn parses_wget_progress() {
        let output = " 51200K .......... .......... 45% 11.2M 3s\r 52000K .. 47% 11.0M 3s";
        assert_eq!(Program::Wget.parse_progress(output), Some(47.0));
        assert_eq!(Program::Wget.parse_progress("Resolving host..."), None);
    }

    #[test]
    fn scanner_joins_tokens_split_across_reads() {
        let mut scanner = ProgressScanner::new(Program::Badblocks);
        assert_eq!(scanner.feed(" 1."), None);
        assert_eq!(scanner.feed("95% done, 0:01 elapsed"), Some(1.95));
        assert_eq!(scanner.feed(" 2.40% do"), None);
        assert_eq!(scanner.feed("ne"), Some(2.4));

        let mut scanner = ProgressScanner::new(Program::Wget);
        assert_eq!(scanner.feed("50K ..... 4"), None);
        assert_eq!(scanner.feed("7% 11.0M"), Some(47.0));
    }

    #[test]
    fn scanner_does_not_report_a_match_twice() {
        let mut scanner = ProgressScanner::new(Program::Badblocks);
        assert_eq!(scanner.feed("10.00% done"), Some(10.0));
        assert_eq!(scanner.feed(", 0:01 elapsed"), None);
        assert!(scanner.carry.len() <= MAX_CARRY);
        assert_eq!(scanner.feed(&"x".repeat(500)), None);
        assert_eq!(scanner.carry.len(), MAX_CARRY);
    }

    #[test]
    fn badblocks_invocation_targets_resource() {
        let programs = ProgramsConfig {
            badblocks: "sudo -n badblocks".into(),
            ..ProgramsConfig::default()
        };
        let invocation = Program::Badblocks
            .invocation("/dev/sda", &Options::new(), &programs)
            .unwrap();

        assert_eq!(invocation.program, "sudo");
        assert_eq!(invocation.args.first().map(String::as_str), Some("-n"));
        assert_eq!(invocation.args.last().map(String::as_str), Some("/dev/sda"));
        assert!(invocation.args.contains(&"-w".to_string()));
    }

    #[test]
    fn wget_invocation_prefers_url_option() {
        let programs = ProgramsConfig::default();
        let mut options = Options::new();

        let invocation = Program::Wget.invocation("/dev/sda", &options, &programs).unwrap();
        assert_eq!(invocation.args.last(), Some(&programs.download_url));

        options.insert("url".into(), "http://example.test/file".into());
        let invocation = Program::Wget.invocation("/dev/sda", &options, &programs).unwrap();
        assert_eq!(invocation.args.last().map(String::as_str), Some("http://example.test/file"));
    }

    #[tokio::test]
    async fn reports_progress_then_done() {
        let events = run(Program::Badblocks, sh(
            "printf '10.50%% done\\n' >&2; sleep 0.05; printf 'noise\\n'; \
             printf '10.50%% done\\n' >&2; sleep 0.05; printf '55.00%% done' >&2"
        )).await;

        assert!(matches!(events[0], CommandEvent::Spawned));
        let updates: Vec<f64> = events.iter()
            .filter_map(|event| match event {
                CommandEvent::Update(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![10.5, 55.0]);
        assert!(matches!(events.last(), Some(CommandEvent::Done)));
    }

    #[tokio::test]
    async fn progress_split_between_writes_is_read_whole() {
        let events = run(Program::Badblocks, sh(
            "printf ' 1.' >&2; sleep 0.3; printf '95%% done' >&2"
        )).await;

        let updates: Vec<f64> = events.iter()
            .filter_map(|event| match event {
                CommandEvent::Update(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![1.95]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let events = run(Program::Wget, sh("exit 3")).await;
        assert!(matches!(
            events.last(),
            Some(CommandEvent::Error(Error::ExitFailure { program: Program::Wget, code: 3 }))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_event() {
        let invocation = Invocation {
            program: "/nonexistent/platter-test-binary".into(),
            args: vec![],
        };
        let events = run(Program::Badblocks, invocation).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CommandEvent::Error(Error::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn stop_terminates_the_process() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut command = Command::new(Program::Badblocks, sh("exec sleep 5"));
        command.start(move |event| {
            let _ = tx.send(event);
        });

        assert!(matches!(rx.recv().await, Some(CommandEvent::Spawned)));
        command.stop();

        let last = tokio::time::timeout(std::time::Duration::from_secs(3), rx.recv())
            .await
            .unwrap();
        assert!(matches!(last, Some(CommandEvent::Error(Error::Terminated { .. }))));
    }
}
