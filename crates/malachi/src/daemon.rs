//! Daemon event loop
//!
//! One task, one pipe. Each iteration waits for the pipe to become
//! readable (bounded by the poll interval), reads one chunk, and
//! dispatches every complete command in it before reading again.
//!
//! A zero-length read means the last writer closed its end. The read end
//! is then reopened and the parser reset, so a record a writer abandoned
//! half way can never be glued onto the next writer's bytes.

use malachi_core::protocol::{MAX_LINE_SIZE, TERMINATOR};
use malachi_core::{Config, Paths};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::time::Duration;
use tokio::net::unix::pipe::Receiver;
use tracing::{debug, error, info, warn};

use crate::handler::{CommandHandler, Flow};
use crate::parser::Parser;
use crate::pipe::CommandPipe;
use crate::shutdown::{signal_name, ShutdownFlag};

/// Exit code for a clean shutdown
pub const EXIT_OK: i32 = 0;
/// Exit code when the command pipe cannot be set up
pub const EXIT_PIPE_FAILURE: i32 = -1;

/// Parser state for one open/close cycle of the pipe's writers
#[derive(Debug, Default)]
pub struct Session {
    parser: Parser,
    generation: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            parser: Parser::new(capacity),
            generation: 0,
        }
    }

    /// Number of completed writer generations
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes held over from an unterminated record
    pub fn pending(&self) -> usize {
        self.parser.len()
    }

    /// Feed one read's worth of bytes and dispatch every complete command.
    ///
    /// A `shutdown` does not cut the batch short: commands that arrived in
    /// the same read are still handled.
    pub fn ingest<H: CommandHandler>(&mut self, bytes: &[u8], handler: &mut H) -> Flow {
        let mut flow = Flow::Continue;

        // One record at a time, so the bound applies per record and not
        // to the whole read
        for piece in bytes.split_inclusive(|&b| b == TERMINATOR) {
            if let Err(e) = self.parser.feed(piece) {
                warn!("{}, dropping the oversized command", e);
                if piece.last() == Some(&TERMINATOR) {
                    self.parser.reset();
                } else {
                    self.parser.resync();
                }
                continue;
            }
            if self.dispatch(handler) == Flow::Shutdown {
                flow = Flow::Shutdown;
            }
        }

        flow
    }

    fn dispatch<H: CommandHandler>(&mut self, handler: &mut H) -> Flow {
        let mut flow = Flow::Continue;
        while let Some(next) = self.parser.next_command() {
            match next {
                Ok(command) => {
                    debug!("Dispatching {} command", command.op());
                    if handler.handle(command) == Flow::Shutdown {
                        flow = Flow::Shutdown;
                    }
                }
                Err(e) => warn!("Skipping command: {}", e),
            }
        }
        flow
    }

    /// The writer side closed; start afresh
    pub fn end_generation(&mut self) {
        if !self.parser.is_empty() {
            debug!(
                "Discarding {} bytes of an unterminated command",
                self.parser.len()
            );
        }
        self.parser.reset();
        self.generation += 1;
    }
}

pub struct Daemon<H> {
    paths: Paths,
    poll_interval: Duration,
    handler: H,
}

impl<H: CommandHandler> Daemon<H> {
    pub fn new(paths: Paths, config: &Config, handler: H) -> Self {
        Self {
            paths,
            poll_interval: config.poll_interval(),
            handler,
        }
    }

    /// Run until a `shutdown` command arrives or `shutdown` is raised.
    ///
    /// Returns the process exit code. The command pipe is removed on every
    /// path out of here.
    pub async fn run(mut self, shutdown: ShutdownFlag) -> i32 {
        if let Err(e) = DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.paths.runtime)
        {
            error!(
                "Failed to create runtime directory {}: {}",
                self.paths.runtime.display(),
                e
            );
            return EXIT_PIPE_FAILURE;
        }

        let pipe = match CommandPipe::create(&self.paths.command_pipe()) {
            Ok(pipe) => pipe,
            Err(e) => {
                error!("{}", e);
                return EXIT_PIPE_FAILURE;
            }
        };
        info!("Listening on {}", pipe.path().display());

        let code = self.serve(&pipe, &shutdown).await;

        match shutdown.signal() {
            Some(signo) => info!("Shutting down on {}", signal_name(signo)),
            None => info!("Shutting down"),
        }
        drop(pipe);
        code
    }

    async fn serve(&mut self, pipe: &CommandPipe, shutdown: &ShutdownFlag) -> i32 {
        let mut session = Session::new();
        let mut receiver = match open(pipe) {
            Ok(receiver) => receiver,
            Err(code) => return code,
        };
        let mut buf = vec![0u8; MAX_LINE_SIZE];

        loop {
            if shutdown.is_requested() {
                return EXIT_OK;
            }

            tokio::select! {
                ready = receiver.readable() => {
                    if let Err(e) = ready {
                        warn!("Command pipe wait failed: {}", e);
                    }
                }
                _ = shutdown.wait() => continue,
                _ = tokio::time::sleep(self.poll_interval) => continue,
            }

            match receiver.try_read(&mut buf) {
                Ok(0) => {
                    debug!("Writer closed the command pipe");
                    session.end_generation();
                    receiver = match open(pipe) {
                        Ok(receiver) => receiver,
                        Err(code) => return code,
                    };
                }
                Ok(n) => {
                    if session.ingest(&buf[..n], &mut self.handler) == Flow::Shutdown {
                        return EXIT_OK;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Failed to read command pipe: {}", e);
                    session.end_generation();
                    receiver = match open(pipe) {
                        Ok(receiver) => receiver,
                        Err(code) => return code,
                    };
                }
            }
        }
    }
}

fn open(pipe: &CommandPipe) -> Result<Receiver, i32> {
    pipe.open_receiver().map_err(|e| {
        error!("Failed to open {}: {}", pipe.path().display(), e);
        EXIT_PIPE_FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Dispatcher;
    use crate::indexer::Indexer;
    use crate::inspector::testing::FakeInspector;
    use crate::status::StatusPublisher;
    use crate::store::IndexStore;
    use malachi_core::Command;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::FileTypeExt;
    use std::path::{Path, PathBuf};
    use std::thread;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Command>,
    }

    impl CommandHandler for Recorder {
        fn handle(&mut self, command: Command) -> Flow {
            let flow = match command {
                Command::Shutdown => Flow::Shutdown,
                _ => Flow::Continue,
            };
            self.seen.push(command);
            flow
        }
    }

    fn add(path: &str) -> Command {
        Command::Add {
            path: PathBuf::from(path),
        }
    }

    fn line(command: &Command) -> Vec<u8> {
        command.encode().unwrap()
    }

    #[test]
    fn test_commands_split_across_reads() {
        let mut session = Session::new();
        let mut recorder = Recorder::default();
        let bytes = line(&add("/srv/a"));
        let (head, tail) = bytes.split_at(7);

        assert_eq!(session.ingest(head, &mut recorder), Flow::Continue);
        assert!(recorder.seen.is_empty());
        assert_eq!(session.ingest(tail, &mut recorder), Flow::Continue);
        assert_eq!(recorder.seen, vec![add("/srv/a")]);
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_abandoned_record_does_not_leak_into_next_writer() {
        let mut session = Session::new();
        let mut recorder = Recorder::default();

        session.ingest(br#"{"op":"add","path":"/srv/aban"#, &mut recorder);
        session.end_generation();
        session.ingest(&line(&add("/srv/b")), &mut recorder);

        assert_eq!(recorder.seen, vec![add("/srv/b")]);
        assert_eq!(session.generation(), 1);
    }

    #[test]
    fn test_shutdown_finishes_the_batch() {
        let mut session = Session::new();
        let mut recorder = Recorder::default();
        let mut bytes = line(&Command::Shutdown);
        bytes.extend(line(&add("/srv/after")));

        assert_eq!(session.ingest(&bytes, &mut recorder), Flow::Shutdown);
        assert_eq!(recorder.seen, vec![Command::Shutdown, add("/srv/after")]);
    }

    #[test]
    fn test_oversized_record_is_dropped_and_stream_continues() {
        let mut session = Session::with_capacity(64);
        let mut recorder = Recorder::default();

        session.ingest(&line(&add("/a")), &mut recorder);
        let long = format!("/{}", "x".repeat(100));
        session.ingest(&line(&add(&long)), &mut recorder);
        session.ingest(&line(&add("/b")), &mut recorder);

        assert_eq!(recorder.seen, vec![add("/a"), add("/b")]);
    }

    #[test]
    fn test_oversized_record_spanning_reads() {
        let mut session = Session::with_capacity(64);
        let mut recorder = Recorder::default();

        let long = line(&add(&format!("/{}", "x".repeat(150))));
        for chunk in long.chunks(50) {
            session.ingest(chunk, &mut recorder);
        }
        session.ingest(&line(&Command::Shutdown), &mut recorder);

        assert_eq!(recorder.seen, vec![Command::Shutdown]);
    }

    #[test]
    fn test_read_larger_than_capacity() {
        let mut session = Session::with_capacity(64);
        let mut recorder = Recorder::default();

        let mut bytes = line(&add("/a"));
        bytes.extend(vec![b'y'; 100]);
        assert_eq!(session.ingest(&bytes, &mut recorder), Flow::Continue);
        assert_eq!(session.pending(), 0);

        // The tail of the oversized record is skipped, the next one parsed
        let mut bytes = b"yyyy\n".to_vec();
        bytes.extend(line(&add("/b")));
        session.ingest(&bytes, &mut recorder);
        assert_eq!(recorder.seen, vec![add("/a"), add("/b")]);
    }

    #[test]
    fn test_many_records_beyond_capacity_in_one_read() {
        let mut session = Session::with_capacity(64);
        let mut recorder = Recorder::default();

        let bytes: Vec<u8> = (0..10).flat_map(|i| line(&add(&format!("/r{i}")))).collect();
        assert!(bytes.len() > 64);
        session.ingest(&bytes, &mut recorder);
        assert_eq!(recorder.seen.len(), 10);
    }

    #[test]
    fn test_malformed_commands_are_skipped() {
        let mut session = Session::new();
        let mut recorder = Recorder::default();
        let mut bytes = b"{\"op\":\"explode\"}\n[1,2]\n".to_vec();
        bytes.extend(line(&add("/srv/ok")));

        assert_eq!(session.ingest(&bytes, &mut recorder), Flow::Continue);
        assert_eq!(recorder.seen, vec![add("/srv/ok")]);
    }

    fn wait_for_fifo(path: &Path) {
        for _ in 0..500 {
            if fs::symlink_metadata(path)
                .map(|m| m.file_type().is_fifo())
                .unwrap_or(false)
            {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("command pipe never appeared at {}", path.display());
    }

    /// Blocks until the daemon has the read end open
    fn write_to_pipe(path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut pipe = fs::OpenOptions::new().write(true).open(path)?;
        pipe.write_all(bytes)
    }

    fn dispatcher(paths: &Paths, repo: &Path) -> anyhow::Result<Dispatcher<FakeInspector>> {
        let store = IndexStore::open(&paths.index_db())?;
        let inspector = FakeInspector::new();
        inspector.commit(repo, "h1", &[("README.md", "r1", 6), ("src/main.py", "m1", 14)]);
        Ok(Dispatcher::new(
            Indexer::new(store, inspector),
            StatusPublisher::new(paths.status_root()),
        ))
    }

    fn fast_config() -> Config {
        Config {
            poll_interval_ms: 20,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_add_then_shutdown_through_the_pipe() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let paths = Paths::under(tmp.path());
        let repo = PathBuf::from("/srv/repo");
        let daemon = Daemon::new(paths.clone(), &fast_config(), dispatcher(&paths, &repo)?);

        let pipe_path = paths.command_pipe();
        let request = [line(&add("/srv/repo")), line(&Command::Shutdown)].concat();
        let writer = thread::spawn(move || {
            wait_for_fifo(&pipe_path);
            write_to_pipe(&pipe_path, &request)
        });

        let code = daemon.run(ShutdownFlag::new()).await;
        writer.join().unwrap()?;

        assert_eq!(code, EXIT_OK);
        assert!(!paths.command_pipe().exists());

        let status = StatusPublisher::new(paths.status_root());
        assert_eq!(status.read(&repo)?, Some("h1".to_string()));
        let store = IndexStore::open(&paths.index_db())?;
        assert_eq!(store.root_commit(&repo)?, Some("h1".to_string()));
        let root_id = store.root_id(&repo)?.unwrap();
        assert_eq!(store.leaves(root_id)?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_writer_after_abandoned_record() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let paths = Paths::under(tmp.path());
        let repo = PathBuf::from("/srv/repo");
        let daemon = Daemon::new(paths.clone(), &fast_config(), dispatcher(&paths, &repo)?);

        let pipe_path = paths.command_pipe();
        let writer = thread::spawn(move || -> io::Result<()> {
            wait_for_fifo(&pipe_path);
            write_to_pipe(&pipe_path, br#"{"op":"add","path":"/srv/aban"#)?;
            // Give the daemon time to see the close and reopen
            thread::sleep(Duration::from_millis(300));
            let request = [line(&add("/srv/repo")), line(&Command::Shutdown)].concat();
            write_to_pipe(&pipe_path, &request)
        });

        let code = daemon.run(ShutdownFlag::new()).await;
        writer.join().unwrap()?;

        assert_eq!(code, EXIT_OK);
        let status = StatusPublisher::new(paths.status_root());
        assert_eq!(status.read(&repo)?, Some("h1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_raised_flag_stops_idle_loop() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let paths = Paths::under(tmp.path());
        let daemon = Daemon::new(paths.clone(), &fast_config(), Recorder::default());

        let flag = ShutdownFlag::new();
        let remote = flag.clone();
        let pipe_path = paths.command_pipe();
        let raiser = thread::spawn(move || {
            wait_for_fifo(&pipe_path);
            thread::sleep(Duration::from_millis(50));
            remote.request_by_signal(libc::SIGTERM);
        });

        let code = daemon.run(flag.clone()).await;
        raiser.join().unwrap();

        assert_eq!(code, EXIT_OK);
        assert_eq!(flag.signal(), Some(libc::SIGTERM));
        assert!(!paths.command_pipe().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_in_the_way_fails_startup() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let paths = Paths::under(tmp.path());
        fs::create_dir_all(&paths.runtime)?;
        fs::write(paths.command_pipe(), "occupied")?;

        let daemon = Daemon::new(paths.clone(), &fast_config(), Recorder::default());
        assert_eq!(daemon.run(ShutdownFlag::new()).await, EXIT_PIPE_FAILURE);
        assert_eq!(fs::read_to_string(paths.command_pipe())?, "occupied");
        Ok(())
    }
}
