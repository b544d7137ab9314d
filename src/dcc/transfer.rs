//! Per-transfer state and the byte-level send/receive loops.
//!
//! Classic DCC flow control: after every block the receiver answers with the
//! cumulative byte position as a 4-byte big-endian integer (modulo 2^32) and
//! the sender does not write the next block until that acknowledgement
//! arrives. Turbo transfers skip the acknowledgements entirely.

use chrono::{DateTime, Local};
use std::io::SeekFrom;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use super::error::{DccError, Result};
use super::ConnectionHandle;

pub type TransferId = usize;

pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Minimum gap between two progress reports from a running loop.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Created, not yet bound to a socket.
    Requested,
    /// We hold `position` bytes locally and sent `DCC RESUME` for them.
    ResumeRequested { position: u64 },
    ResumeAccepted,
    Listening,
    Connecting,
    Connected,
    Transferring,
    Completed,
    Failed { reason: String },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed { .. })
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TransferState::Failed {
            reason: reason.into(),
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: &TransferState) -> bool {
        use TransferState::*;

        if matches!(next, Failed { .. }) {
            return !self.is_terminal();
        }
        match self {
            Requested => matches!(next, ResumeRequested { .. } | Listening | Connecting),
            // An ACCEPT at another position sends the transfer back to the start.
            ResumeRequested { .. } => {
                matches!(next, Requested | ResumeAccepted | Listening | Connecting)
            }
            ResumeAccepted => matches!(next, Listening | Connecting),
            Listening | Connecting => matches!(next, Connected),
            Connected => matches!(next, Transferring | Completed),
            Transferring => matches!(next, Completed),
            Completed | Failed { .. } => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransferState::Requested => "requested",
            TransferState::ResumeRequested { .. } => "resume requested",
            TransferState::ResumeAccepted => "resume accepted",
            TransferState::Listening => "listening",
            TransferState::Connecting => "connecting",
            TransferState::Connected => "connected",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed { .. } => "failed",
        }
    }
}

/// One DCC file transfer. Owned by the [`Registry`](super::registry::Registry).
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub token: Option<String>,
    pub direction: Direction,
    pub remote_nickname: String,
    pub connection: ConnectionHandle,
    pub host: Ipv4Addr,
    /// `0` until a reverse transfer learns its port.
    pub port: u16,
    /// Negotiated as reverse DCC: the offer carried port 0. Survives the
    /// port being learned later.
    pub reverse: bool,
    /// Name as it travels on the wire.
    pub filename: String,
    pub local_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub start_offset: u64,
    pub turbo: bool,
    pub block_size: u32,
    pub state: TransferState,
    /// Bytes moved over the socket in this session (excludes `start_offset`).
    pub transferred: u64,
    pub started_at: Option<DateTime<Local>>,
}

impl Transfer {
    pub fn new(
        direction: Direction,
        remote_nickname: impl Into<String>,
        connection: ConnectionHandle,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            token: None,
            direction,
            remote_nickname: remote_nickname.into(),
            connection,
            host: Ipv4Addr::UNSPECIFIED,
            port: 0,
            reverse: false,
            filename: filename.into(),
            local_path: None,
            file_size: None,
            start_offset: 0,
            turbo: false,
            block_size: DEFAULT_BLOCK_SIZE,
            state: TransferState::Requested,
            transferred: 0,
            started_at: None,
        }
    }

    /// The filename without any directory part, for either path separator.
    pub fn short_filename(&self) -> &str {
        short_name(&self.filename)
    }

    pub fn position(&self) -> u64 {
        self.start_offset + self.transferred
    }

    pub fn percent(&self) -> Option<f64> {
        match self.file_size {
            Some(0) => Some(100.0),
            Some(size) => Some(self.position() as f64 * 100.0 / size as f64),
            None => None,
        }
    }

    pub fn bytes_per_second(&self) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        let elapsed_ms = (Local::now() - started).num_milliseconds();
        if elapsed_ms <= 0 {
            return self.transferred as f64;
        }
        self.transferred as f64 * 1000.0 / elapsed_ms as f64
    }

    /// Estimated seconds left, if both the size and a rate are known.
    pub fn remaining_secs(&self) -> Option<f64> {
        let size = self.file_size?;
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(size.saturating_sub(self.position()) as f64 / rate)
    }

    pub fn is_complete(&self) -> bool {
        self.file_size == Some(self.position())
    }
}

pub(crate) fn short_name(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// Parameters shared by the send and receive loops.
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub path: PathBuf,
    pub start_offset: u64,
    pub file_size: Option<u64>,
    pub block_size: u32,
    pub turbo: bool,
    /// Receive only: how long the socket may stay silent.
    pub idle_timeout: Duration,
}

impl StreamPlan {
    fn buffer(&self) -> Vec<u8> {
        vec![0u8; self.block_size.max(1) as usize]
    }
}

/// Reports `bytes_done` at most every [`PROGRESS_INTERVAL`], plus a final
/// report when the loop finishes.
struct Throttle {
    last: Instant,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    fn due(&mut self) -> bool {
        if self.last.elapsed() >= PROGRESS_INTERVAL {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Stream a local file to the peer starting at `plan.start_offset`.
///
/// `on_block` is called after every block written with the number of bytes
/// sent so far in this session; `on_progress` is the throttled variant.
/// Returns the number of bytes sent.
pub async fn run_send<S, B, P>(
    stream: &mut S,
    plan: &StreamPlan,
    mut on_block: B,
    mut on_progress: P,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: FnMut(u64),
    P: FnMut(u64),
{
    let mut file = tokio::fs::File::open(&plan.path).await?;
    if plan.start_offset > 0 {
        file.seek(SeekFrom::Start(plan.start_offset)).await?;
    }

    let mut buf = plan.buffer();
    let mut position = plan.start_offset;
    let mut sent: u64 = 0;
    let mut throttle = Throttle::new();

    loop {
        if plan.file_size.is_some_and(|size| position >= size) {
            break;
        }
        let n = read_block(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }

        stream.write_all(&buf[..n]).await?;
        stream.flush().await?;
        position += n as u64;
        sent += n as u64;
        on_block(sent);

        if !plan.turbo {
            match wait_for_ack(stream, position).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(DccError::PeerClosed {
                        position,
                        expected: plan.file_size.unwrap_or(position),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        if throttle.due() {
            on_progress(sent);
        }
    }
    on_progress(sent);

    // Half-close first so a receiver of unknown size sees EOF.
    stream.shutdown().await.ok();
    if plan.turbo {
        drain_acks(stream, position, plan.idle_timeout).await;
    }
    Ok(sent)
}

/// Fill `buf` from the file, short only at end of file.
async fn read_block(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Block until the peer acknowledges `position`.
async fn wait_for_ack<S>(stream: &mut S, position: u64) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let expected = position as u32;
    loop {
        if stream.read_u32().await? == expected {
            return Ok(());
        }
    }
}

/// After a turbo send, swallow whatever acknowledgements a non-turbo peer
/// sent anyway, until it closes, acknowledges everything or goes quiet for
/// `idle`.
async fn drain_acks<S>(stream: &mut S, position: u64, idle: Duration)
where
    S: AsyncRead + Unpin,
{
    let expected = position as u32;
    loop {
        match tokio::time::timeout(idle, stream.read_u32()).await {
            Ok(Ok(ack)) if ack != expected => continue,
            Ok(_) => break,
            Err(_) => {
                tracing::debug!(position, "turbo receiver kept the connection open; giving up on it");
                break;
            }
        }
    }
}

/// Receive a file from the peer into `plan.path`.
///
/// Appends when resuming (`start_offset > 0`), truncates otherwise. Returns
/// the number of bytes received in this session.
pub async fn run_receive<S, P>(stream: &mut S, plan: &StreamPlan, mut on_progress: P) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: FnMut(u64),
{
    if let Some(parent) = plan.path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if plan.start_offset > 0 {
        options.append(true);
    } else {
        options.truncate(true);
    }
    let mut file = options.open(&plan.path).await?;

    let mut buf = plan.buffer();
    let mut position = plan.start_offset;
    let mut received: u64 = 0;
    let mut throttle = Throttle::new();

    loop {
        if plan.file_size.is_some_and(|size| position >= size) {
            break;
        }

        let n = match tokio::time::timeout(plan.idle_timeout, stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) if plan.file_size.is_none() => {
                tracing::debug!(received, "idle receive with unknown size treated as complete");
                break;
            }
            Err(_) => {
                file.flush().await?;
                return Err(DccError::IdleTimeout {
                    secs: plan.idle_timeout.as_secs(),
                });
            }
        };

        if n == 0 {
            file.flush().await?;
            return match plan.file_size {
                Some(size) if position < size => Err(DccError::PeerClosed {
                    position,
                    expected: size,
                }),
                _ => {
                    on_progress(received);
                    Ok(received)
                }
            };
        }

        file.write_all(&buf[..n]).await?;
        position += n as u64;
        received += n as u64;

        if !plan.turbo {
            stream.write_all(&(position as u32).to_be_bytes()).await?;
            stream.flush().await?;
        }
        if throttle.due() {
            on_progress(received);
        }
    }

    file.flush().await?;
    on_progress(received);
    Ok(received)
}

/// Remove a receive target that never got any data.
pub async fn discard_if_empty(path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.is_file() && meta.len() == 0 {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn plan(path: PathBuf, size: Option<u64>, turbo: bool) -> StreamPlan {
        StreamPlan {
            path,
            start_offset: 0,
            file_size: size,
            block_size: 1024,
            turbo,
            idle_timeout: Duration::from_secs(5),
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_state_transitions() {
        use TransferState::*;
        assert!(Requested.can_transition_to(&Connecting));
        assert!(Requested.can_transition_to(&ResumeRequested { position: 10 }));
        assert!(ResumeRequested { position: 10 }.can_transition_to(&ResumeAccepted));
        assert!(ResumeRequested { position: 10 }.can_transition_to(&Listening));
        assert!(ResumeRequested { position: 10 }.can_transition_to(&Requested));
        assert!(ResumeAccepted.can_transition_to(&Connecting));
        assert!(Listening.can_transition_to(&Connected));
        assert!(Connected.can_transition_to(&Transferring));
        assert!(Transferring.can_transition_to(&Completed));
        assert!(Transferring.can_transition_to(&TransferState::failed("boom")));

        assert!(!Requested.can_transition_to(&Transferring));
        assert!(!Listening.can_transition_to(&Completed));
        assert!(!Completed.can_transition_to(&TransferState::failed("late")));
        assert!(!TransferState::failed("x").can_transition_to(&Connecting));
    }

    #[test]
    fn test_short_filename_and_progress() {
        let mut t = Transfer::new(Direction::Receive, "bob", 0, "C:\\files\\dir/report.txt");
        assert_eq!(t.short_filename(), "report.txt");

        t.file_size = Some(200);
        t.start_offset = 50;
        t.transferred = 50;
        assert_eq!(t.percent(), Some(50.0));
        assert!(!t.is_complete());
        t.transferred = 150;
        assert!(t.is_complete());

        t.file_size = None;
        assert_eq!(t.percent(), None);
        assert_eq!(t.remaining_secs(), None);
    }

    #[tokio::test]
    async fn test_turbo_send_streams_without_acks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let data = sample(10_240);
        tokio::fs::write(&src, &data).await.unwrap();

        let (mut ours, mut theirs) = duplex(64 * 1024);
        let peer = tokio::spawn(async move {
            let mut got = Vec::new();
            theirs.read_to_end(&mut got).await.unwrap();
            got
        });

        let mut blocks = 0;
        let sent = run_send(
            &mut ours,
            &plan(src, Some(10_240), true),
            |_| blocks += 1,
            |_| {},
        )
        .await
        .unwrap();
        drop(ours);

        assert_eq!(sent, 10_240);
        assert_eq!(blocks, 10);
        assert_eq!(peer.await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_turbo_send_ends_when_receiver_lingers() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, sample(2048)).await.unwrap();

        let (mut ours, mut theirs) = duplex(64 * 1024);
        // Reads everything, then holds its end open without a word.
        let peer = tokio::spawn(async move {
            let mut got = vec![0u8; 2048];
            theirs.read_exact(&mut got).await.unwrap();
            (got, theirs)
        });

        let mut quiet = plan(src, Some(2048), true);
        quiet.idle_timeout = Duration::from_millis(200);
        let sent = tokio::time::timeout(
            Duration::from_secs(5),
            run_send(&mut ours, &quiet, |_| {}, |_| {}),
        )
        .await
        .expect("send should not wait on a silent receiver")
        .unwrap();

        assert_eq!(sent, 2048);
        let (got, _still_open) = peer.await.unwrap();
        assert_eq!(got, sample(2048));
    }

    #[tokio::test]
    async fn test_turbo_receive_sends_no_acks() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.bin");
        let data = sample(10_240);

        let (mut ours, mut theirs) = duplex(64 * 1024);
        let payload = data.clone();
        let peer = tokio::spawn(async move {
            theirs.write_all(&payload).await.unwrap();
            let mut back = Vec::new();
            theirs.read_to_end(&mut back).await.unwrap();
            back
        });

        let received = run_receive(&mut ours, &plan(dst.clone(), Some(10_240), true), |_| {})
            .await
            .unwrap();
        drop(ours);

        assert_eq!(received, 10_240);
        assert!(peer.await.unwrap().is_empty(), "turbo receiver must not ack");
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_acknowledged_transfer_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("out/dst.bin");
        let data = sample(5_000);
        tokio::fs::write(&src, &data).await.unwrap();

        let (mut a, mut b) = duplex(8 * 1024);
        let send_plan = plan(src, Some(5_000), false);
        let recv_plan = plan(dst.clone(), Some(5_000), false);

        let sender = tokio::spawn(async move { run_send(&mut a, &send_plan, |_| {}, |_| {}).await });
        let received = run_receive(&mut b, &recv_plan, |_| {}).await.unwrap();

        assert_eq!(received, 5_000);
        assert_eq!(sender.await.unwrap().unwrap(), 5_000);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_sender_waits_for_each_ack() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, sample(3_000)).await.unwrap();

        let (mut ours, mut theirs) = duplex(64 * 1024);
        let send_plan = plan(src, Some(3_000), false);
        let sender = tokio::spawn(async move { run_send(&mut ours, &send_plan, |_| {}, |_| {}).await });

        // Only one block may be outstanding until we acknowledge it.
        let mut block = vec![0u8; 1024];
        theirs.read_exact(&mut block).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(50), theirs.read(&mut probe)).await;
        assert!(early.is_err(), "sender wrote past an unacknowledged block");

        let mut total = 1024u32;
        theirs.write_u32(total).await.unwrap();
        for expected in [1024usize, 952] {
            let mut next = vec![0u8; expected];
            theirs.read_exact(&mut next).await.unwrap();
            total += expected as u32;
            theirs.write_u32(total).await.unwrap();
        }
        assert_eq!(sender.await.unwrap().unwrap(), 3_000);
    }

    #[tokio::test]
    async fn test_resume_appends_and_acks_absolute_position() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("part.bin");
        let data = sample(2_000);
        tokio::fs::write(&dst, &data[..500]).await.unwrap();

        let (mut ours, mut theirs) = duplex(64 * 1024);
        let rest = data[500..].to_vec();
        let peer = tokio::spawn(async move {
            theirs.write_all(&rest).await.unwrap();
            let mut last = 0;
            while let Ok(ack) = theirs.read_u32().await {
                last = ack;
            }
            last
        });

        let mut recv_plan = plan(dst.clone(), Some(2_000), false);
        recv_plan.start_offset = 500;
        let received = run_receive(&mut ours, &recv_plan, |_| {}).await.unwrap();
        drop(ours);

        assert_eq!(received, 1_500);
        assert_eq!(peer.await.unwrap(), 2_000);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_resumed_send_starts_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let data = sample(4_000);
        tokio::fs::write(&src, &data).await.unwrap();

        let (mut ours, mut theirs) = duplex(64 * 1024);
        let peer = tokio::spawn(async move {
            let mut got = Vec::new();
            theirs.read_to_end(&mut got).await.unwrap();
            got
        });

        let mut send_plan = plan(src, Some(4_000), true);
        send_plan.start_offset = 1_000;
        let sent = run_send(&mut ours, &send_plan, |_| {}, |_| {}).await.unwrap();
        drop(ours);

        assert_eq!(sent, 3_000);
        assert_eq!(peer.await.unwrap(), data[1_000..].to_vec());
    }

    #[tokio::test]
    async fn test_unknown_size_completes_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("stream.bin");

        let (mut ours, mut theirs) = duplex(64 * 1024);
        tokio::spawn(async move {
            theirs.write_all(&sample(700)).await.unwrap();
            theirs.shutdown().await.unwrap();
            // Keep reading acks until the receiver hangs up.
            let mut sink = Vec::new();
            let _ = theirs.read_to_end(&mut sink).await;
        });

        let received = run_receive(&mut ours, &plan(dst, None, true), |_| {}).await.unwrap();
        assert_eq!(received, 700);
    }

    #[tokio::test]
    async fn test_early_close_fails_known_size() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("short.bin");

        let (mut ours, mut theirs) = duplex(64 * 1024);
        tokio::spawn(async move {
            theirs.write_all(&sample(100)).await.unwrap();
        });

        let err = run_receive(&mut ours, &plan(dst.clone(), Some(1_000), true), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DccError::PeerClosed { position: 100, expected: 1_000 }));
        // The partial file stays for a later resume.
        assert_eq!(tokio::fs::metadata(&dst).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_idle_unknown_size_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("idle.bin");

        let (mut ours, mut theirs) = duplex(1024);
        theirs.write_all(b"hello").await.unwrap();

        let mut idle_plan = plan(dst, None, true);
        idle_plan.idle_timeout = Duration::from_millis(100);
        let received = run_receive(&mut ours, &idle_plan, |_| {}).await.unwrap();
        assert_eq!(received, 5);
        drop(theirs);
    }

    #[tokio::test]
    async fn test_discard_if_empty() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        tokio::fs::write(&empty, b"").await.unwrap();
        tokio::fs::write(&full, b"x").await.unwrap();

        discard_if_empty(&empty).await;
        discard_if_empty(&full).await;
        assert!(!empty.exists());
        assert!(full.exists());
    }
}
