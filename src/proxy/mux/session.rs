/// 多路复用会话
///
/// 一条底层连接上承载多条逻辑流。写方向由单个写任务串行化，
/// 读任务按 stream_id 把数据分发给各流自己的接收队列，
/// 某条流读得慢不会阻塞其它流；发送端受对端窗口约束，内存有界。
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::{CancellationToken, PollSemaphore};
use tracing::{debug, trace, warn};

use super::yamux::{self, flags, goaway, FrameType, Header};
use super::MuxConfig;
use crate::common::{ProxyStream, SudokuError};

struct StreamEntry {
    /// 对端 FIN/RST 后置空，读端随之看到 EOF
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// 发送额度，等于对端剩余接收窗口
    credit: Arc<Semaphore>,
    /// 本端剩余接收窗口
    recv_window: u32,
    /// 流被对端或协议错误重置，读端报 ConnectionReset 而非 EOF
    reset: Arc<AtomicBool>,
}

/// 新登记流的本端句柄
struct Registered {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    credit: Arc<Semaphore>,
    reset: Arc<AtomicBool>,
}

struct Shared {
    config: MuxConfig,
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    going_away: AtomicBool,
    ping_outstanding: AtomicU32,
    shutdown: CancellationToken,
}

impl Shared {
    fn send(&self, frame: Vec<u8>) -> bool {
        self.frames.send(frame).is_ok()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<u32, StreamEntry>> {
        // 持锁区间内没有会 panic 的代码，中毒时照常使用
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: u32) -> Registered {
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.config.window as usize));
        let reset = Arc::new(AtomicBool::new(false));
        self.entries().insert(
            id,
            StreamEntry {
                inbound: Some(tx),
                credit: credit.clone(),
                recv_window: self.config.window,
                reset: reset.clone(),
            },
        );
        Registered {
            inbound: rx,
            credit,
            reset,
        }
    }

    fn terminate(&self) {
        self.going_away.store(true, Ordering::Release);
        self.shutdown.cancel();
        for (_, entry) in self.entries().drain() {
            entry.credit.close();
        }
    }
}

/// 一条多路复用会话；可同时在多个任务里开流与收流
pub struct MuxSession {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// 客户端使用奇数流 ID
    pub fn client(stream: ProxyStream, config: MuxConfig) -> Self {
        Self::spawn(stream, config, 1)
    }

    /// 服务端使用偶数流 ID
    pub fn server(stream: ProxyStream, config: MuxConfig) -> Self {
        Self::spawn(stream, config, 2)
    }

    fn spawn(stream: ProxyStream, config: MuxConfig, first_id: u32) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let keepalive = config.keepalive_interval;

        let shared = Arc::new(Shared {
            config,
            next_id: AtomicU32::new(first_id),
            streams: Mutex::new(HashMap::new()),
            frames: frame_tx,
            going_away: AtomicBool::new(false),
            ping_outstanding: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, frame_rx, shared.shutdown.clone()));
        tokio::spawn(read_loop(reader, shared.clone(), accept_tx));
        if !keepalive.is_zero() {
            tokio::spawn(keepalive_loop(shared.clone()));
        }

        MuxSession {
            shared,
            incoming: tokio::sync::Mutex::new(accept_rx),
        }
    }

    pub async fn open_stream(&self) -> Result<MuxStream, SudokuError> {
        if self.is_closed() {
            return Err(SudokuError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "mux session is closed",
            )));
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let registered = self.shared.register(id);
        if !self.shared.send(yamux::encode_window_update(id, flags::SYN, 0)) {
            self.shared.entries().remove(&id);
            return Err(SudokuError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        trace!(stream = id, "mux stream opened");
        Ok(MuxStream::new(id, self.shared.clone(), registered))
    }

    /// 会话关闭后返回 None
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.incoming.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.going_away.load(Ordering::Acquire) || self.shared.shutdown.is_cancelled()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.entries().len()
    }

    /// 发 GoAway 并关闭会话，所有流随之结束
    pub fn close(&self) {
        if !self.shared.shutdown.is_cancelled() {
            self.shared.send(yamux::encode_goaway(goaway::NORMAL));
            self.shared.terminate();
        }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut writer: WriteHalf<ProxyStream>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else { break };
        if writer.write_all(&frame).await.is_err() {
            shutdown.cancel();
            return;
        }
        while let Ok(more) = frames.try_recv() {
            if writer.write_all(&more).await.is_err() {
                shutdown.cancel();
                return;
            }
        }
        if writer.flush().await.is_err() {
            shutdown.cancel();
            return;
        }
    }
    // 关闭前尽量把排队的帧（GoAway、FIN）写出去
    while let Ok(frame) = frames.try_recv() {
        if writer.write_all(&frame).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: ReadHalf<ProxyStream>, shared: Arc<Shared>, accept: mpsc::Sender<MuxStream>) {
    let result = tokio::select! {
        r = dispatch_frames(&mut reader, &shared, &accept) => r,
        _ = shared.shutdown.cancelled() => Ok(()),
    };
    match result {
        Ok(()) => debug!("mux session closed"),
        Err(SudokuError::Io(e)) => debug!(error = %e, "mux connection ended"),
        Err(e) => {
            warn!(error = %e, "mux protocol error");
            shared.send(yamux::encode_goaway(goaway::PROTOCOL_ERROR));
        }
    }
    shared.terminate();
}

async fn dispatch_frames(
    reader: &mut ReadHalf<ProxyStream>,
    shared: &Arc<Shared>,
    accept: &mpsc::Sender<MuxStream>,
) -> Result<(), SudokuError> {
    let window = shared.config.window;
    loop {
        let header = Header::read_from(reader).await?;
        match header.frame_type {
            FrameType::Ping => {
                if header.has(flags::SYN) {
                    shared.send(yamux::encode_ping(flags::ACK, header.length));
                } else if header.has(flags::ACK) {
                    let _ = shared.ping_outstanding.compare_exchange(
                        header.length,
                        0,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
                continue;
            }
            FrameType::GoAway => {
                debug!(reason = header.length, "mux peer going away");
                shared.going_away.store(true, Ordering::Release);
                continue;
            }
            FrameType::Data | FrameType::WindowUpdate => {}
        }

        let id = header.stream_id;
        let payload = if header.frame_type == FrameType::Data {
            if header.length > window {
                return Err(SudokuError::InvalidFrame(format!(
                    "mux data frame of {} bytes exceeds window",
                    header.length
                )));
            }
            let mut payload = vec![0u8; header.length as usize];
            reader.read_exact(&mut payload).await.map_err(SudokuError::from_io)?;
            payload
        } else {
            Vec::new()
        };

        if header.has(flags::SYN) {
            accept_remote(shared, accept, id);
        }

        let mut streams = shared.entries();
        let Some(entry) = streams.get_mut(&id) else {
            drop(streams);
            if !header.has(flags::RST) && !header.has(flags::FIN) && id != 0 {
                shared.send(yamux::encode_window_update(id, flags::RST, 0));
            }
            continue;
        };

        if header.frame_type == FrameType::WindowUpdate && header.length > 0 {
            entry.credit.add_permits(header.length as usize);
        }
        if !payload.is_empty() {
            if payload.len() as u32 > entry.recv_window {
                warn!(stream = id, "mux peer overran receive window");
                entry.reset.store(true, Ordering::Release);
                entry.credit.close();
                streams.remove(&id);
                drop(streams);
                shared.send(yamux::encode_window_update(id, flags::RST, 0));
                continue;
            }
            entry.recv_window -= payload.len() as u32;
            if let Some(tx) = &entry.inbound {
                let _ = tx.send(payload);
            }
        }
        if header.has(flags::RST) {
            entry.reset.store(true, Ordering::Release);
            entry.credit.close();
            streams.remove(&id);
        } else if header.has(flags::FIN) {
            entry.inbound = None;
        }
    }
}

fn accept_remote(shared: &Arc<Shared>, accept: &mpsc::Sender<MuxStream>, id: u32) {
    if shared.entries().contains_key(&id) {
        return;
    }
    let registered = shared.register(id);
    let stream = MuxStream::new(id, shared.clone(), registered);
    match accept.try_send(stream) {
        Ok(()) => {
            shared.send(yamux::encode_window_update(id, flags::ACK, 0));
            trace!(stream = id, "mux stream accepted");
        }
        Err(e) => {
            debug!(stream = id, "mux accept backlog full, resetting");
            let mut stream = e.into_inner();
            stream.reset();
        }
    }
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.keepalive_interval);
    ticker.tick().await;
    let mut opaque: u32 = 0;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if shared.ping_outstanding.load(Ordering::Acquire) != 0 {
            warn!("mux keepalive timed out");
            shared.terminate();
            return;
        }
        opaque = opaque.wrapping_add(1).max(1);
        shared.ping_outstanding.store(opaque, Ordering::Release);
        if !shared.send(yamux::encode_ping(flags::SYN, opaque)) {
            return;
        }
    }
}

/// 一条逻辑流
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: BytesMut,
    credit: PollSemaphore,
    consumed: u32,
    write_closed: bool,
    reset: bool,
    remote_reset: Arc<AtomicBool>,
}

impl MuxStream {
    fn new(id: u32, shared: Arc<Shared>, registered: Registered) -> Self {
        MuxStream {
            id,
            shared,
            inbound: registered.inbound,
            pending: BytesMut::new(),
            credit: PollSemaphore::new(registered.credit),
            consumed: 0,
            write_closed: false,
            reset: false,
            remote_reset: registered.reset,
        }
    }

    fn is_reset(&self) -> bool {
        self.reset || self.remote_reset.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 立即中止本流，对端读写均报错
    pub fn reset(&mut self) {
        if self.reset {
            return;
        }
        self.reset = true;
        self.write_closed = true;
        if let Some(entry) = self.shared.entries().remove(&self.id) {
            entry.credit.close();
        }
        self.shared.send(yamux::encode_window_update(self.id, flags::RST, 0));
    }

    /// 消费过半个窗口就归还额度
    fn replenish(&mut self, n: usize) {
        self.consumed += n as u32;
        let threshold = self.shared.config.window / 2;
        if self.consumed < threshold {
            return;
        }
        let delta = std::mem::take(&mut self.consumed);
        if let Some(entry) = self.shared.entries().get_mut(&self.id) {
            entry.recv_window += delta;
        } else {
            return;
        }
        self.shared.send(yamux::encode_window_update(self.id, 0, delta));
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match ready!(self.inbound.poll_recv(cx)) {
                Some(data) => self.pending.extend_from_slice(&data),
                None if self.is_reset() => return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.replenish(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let available = self.credit.available_permits().max(1);
        let want = buf.len().min(self.shared.config.max_frame).min(available);
        let Some(permit) = ready!(self.credit.poll_acquire_many(cx, want as u32)) else {
            // 额度信号量被关闭：流被重置或会话结束
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        };
        permit.forget();
        if !self.shared.send(yamux::encode_data(self.id, 0, &buf[..want])) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(want))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.write_closed {
            self.write_closed = true;
            self.shared.send(yamux::encode_data(self.id, flags::FIN, &[]));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if self.is_reset() {
            return;
        }
        if !self.write_closed {
            self.shared.send(yamux::encode_data(self.id, flags::FIN, &[]));
        }
        self.shared.entries().remove(&self.id);
    }
}
