use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ConsumerConfig;
use crate::message::{InFlight, Message, Responder};
use crate::protocol::{CLOSE_WAIT, Command, Frame, HEARTBEAT, MAGIC_V2, NsqCodec, RESPONSE_OK};
use crate::NsqError;

type Reader = FramedRead<OwnedReadHalf, NsqCodec>;
type Writer = FramedWrite<OwnedWriteHalf, NsqCodec>;

#[derive(Serialize)]
struct IdentifyBody<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
    heartbeat_interval: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_timeout: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentifyResponse {
    #[serde(default)]
    max_rdy_count: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════
//  Connection: установленное и подписанное соединение с nsqd
// ═══════════════════════════════════════════════════════════════

pub(crate) struct Connection {
    pub(crate) addr: Arc<str>,
    /// Верхняя граница RDY, объявленная nsqd.
    pub(crate) max_rdy: u64,
    reader: Reader,
    writer: Writer,
}

/// Handle живого соединения, хранится в consumer'е.
pub(crate) struct ConnHandle {
    pub(crate) max_rdy: u64,
    commands: mpsc::UnboundedSender<Command>,
    close: CancellationToken,
}

impl ConnHandle {
    pub(crate) fn set_rdy(&self, count: u64) {
        let _ = self.commands.send(Command::Rdy(count.min(self.max_rdy)));
    }

    pub(crate) fn close(&self) {
        self.close.cancel();
    }
}

impl Connection {
    /// TCP connect → magic → IDENTIFY → SUB.
    pub(crate) async fn connect(
        addr: &str,
        topic: &str,
        channel: &str,
        cfg: &ConsumerConfig,
    ) -> Result<Self, NsqError> {
        let stream = tokio::time::timeout(cfg.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NsqError::DialTimeout { addr: addr.to_string(), timeout: cfg.dial_timeout })?
            .map_err(|e| NsqError::Dial { addr: addr.to_string(), source: e })?;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(MAGIC_V2).await?;

        let codec = NsqCodec::new(cfg.max_frame_size);
        let mut conn = Self {
            addr: Arc::from(addr),
            max_rdy: u64::MAX,
            reader: FramedRead::new(read_half, codec.clone()),
            writer: FramedWrite::new(write_half, codec),
        };

        let identify = IdentifyBody {
            client_id: &cfg.client_id,
            hostname: &cfg.hostname,
            user_agent: &cfg.user_agent,
            feature_negotiation: true,
            heartbeat_interval: cfg.heartbeat_interval.as_millis() as i64,
            msg_timeout: cfg.msg_timeout.map(|t| t.as_millis() as i64),
        };
        conn.send(Command::Identify(Bytes::from(serde_json::to_vec(&identify)?)), cfg).await?;
        let resp = conn.expect_response(cfg).await?;
        if resp != RESPONSE_OK {
            let negotiated: IdentifyResponse = serde_json::from_slice(&resp)?;
            if let Some(max_rdy) = negotiated.max_rdy_count {
                conn.max_rdy = max_rdy.max(1);
            }
        }

        conn.send(Command::Sub { topic: topic.to_string(), channel: channel.to_string() }, cfg).await?;
        let resp = conn.expect_response(cfg).await?;
        if resp != RESPONSE_OK {
            return Err(NsqError::Protocol(format!(
                "SUB: unexpected response {:?}",
                String::from_utf8_lossy(&resp)
            )));
        }

        tracing::info!(nsqd = %addr, %topic, %channel, max_rdy = conn.max_rdy, "subscribed");
        Ok(conn)
    }

    async fn send(&mut self, cmd: Command, cfg: &ConsumerConfig) -> Result<(), NsqError> {
        let name = cmd.name();
        tokio::time::timeout(cfg.write_timeout, self.writer.send(cmd))
            .await
            .map_err(|_| NsqError::Protocol(format!("{name}: write timed out")))?
    }

    /// Следующий не-heartbeat ответ во время handshake.
    async fn expect_response(&mut self, cfg: &ConsumerConfig) -> Result<Bytes, NsqError> {
        loop {
            let frame = tokio::time::timeout(cfg.read_timeout, self.reader.next())
                .await
                .map_err(|_| NsqError::Protocol("handshake: read timed out".into()))?
                .ok_or_else(|| NsqError::Protocol("handshake: connection closed".into()))??;
            match frame {
                Frame::Response(data) if data == HEARTBEAT => {
                    self.send(Command::Nop, cfg).await?;
                }
                Frame::Response(data) => return Ok(data),
                Frame::Error(data) => {
                    return Err(NsqError::ErrorFrame(String::from_utf8_lossy(&data).into_owned()));
                }
                Frame::Message(_) => {
                    return Err(NsqError::Protocol("handshake: unexpected message frame".into()));
                }
            }
        }
    }

    /// Запустить reader/writer. `close`: запрос на закрытие (CLS),
    /// `incoming`: канал к воркерам обработчика. Возвращает handle и
    /// future, которая завершается, когда соединение полностью закрыто.
    pub(crate) fn run(
        self,
        incoming: mpsc::Sender<Message>,
        close: CancellationToken,
        cfg: Arc<ConsumerConfig>,
    ) -> (ConnHandle, impl Future<Output = ()> + Send + 'static) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = ConnHandle {
            max_rdy: self.max_rdy,
            commands: cmd_tx.clone(),
            close: close.clone(),
        };
        let Connection { addr, reader, writer, .. } = self;

        let fut = async move {
            let writer_stop = CancellationToken::new();
            let writer_task = tokio::spawn(write_loop(
                addr.clone(),
                writer,
                cmd_rx,
                writer_stop.clone(),
                cfg.clone(),
            ));

            let in_flight = Arc::new(InFlight::default());
            let responder = Responder { commands: cmd_tx, in_flight: in_flight.clone() };
            read_loop(&addr, reader, &responder, &incoming, &close, &writer_stop, &cfg).await;
            drop(incoming);

            if in_flight.count() > 0 {
                tracing::debug!(nsqd = %addr, in_flight = in_flight.count(), "draining in-flight messages");
                if tokio::time::timeout(cfg.drain_timeout, in_flight.wait_drained()).await.is_err() {
                    tracing::warn!(nsqd = %addr, in_flight = in_flight.count(), "drain timed out");
                }
            }

            writer_stop.cancel();
            let _ = writer_task.await;
            tracing::info!(nsqd = %addr, "connection closed");
        };
        (handle, fut)
    }
}

async fn read_loop(
    addr: &Arc<str>,
    mut reader: Reader,
    responder: &Responder,
    incoming: &mpsc::Sender<Message>,
    close: &CancellationToken,
    writer_failed: &CancellationToken,
    cfg: &ConsumerConfig,
) {
    let mut closing = false;
    let mut close_deadline = Instant::now();
    loop {
        tokio::select! {
            _ = close.cancelled(), if !closing => {
                closing = true;
                close_deadline = Instant::now() + cfg.drain_timeout;
                tracing::debug!(nsqd = %addr, "sending CLS");
                if responder.commands.send(Command::Cls).is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(close_deadline), if closing => {
                tracing::warn!(nsqd = %addr, "no CLOSE_WAIT after CLS, closing anyway");
                return;
            }
            _ = writer_failed.cancelled() => return,
            frame = tokio::time::timeout(cfg.read_timeout, reader.next()) => {
                let frame = match frame {
                    Err(_) => {
                        tracing::warn!(nsqd = %addr, timeout = ?cfg.read_timeout, "read timed out");
                        return;
                    }
                    Ok(None) => {
                        tracing::debug!(nsqd = %addr, "EOF");
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::error!(nsqd = %addr, error = %e, "read error");
                        return;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                match frame {
                    Frame::Response(data) if data == HEARTBEAT => {
                        tracing::trace!(nsqd = %addr, "heartbeat");
                        let _ = responder.commands.send(Command::Nop);
                    }
                    Frame::Response(data) if data == CLOSE_WAIT => {
                        tracing::debug!(nsqd = %addr, "CLOSE_WAIT");
                        return;
                    }
                    Frame::Response(data) => {
                        tracing::debug!(nsqd = %addr, response = %String::from_utf8_lossy(&data), "response");
                    }
                    Frame::Error(data) => {
                        // E_FIN_FAILED / E_REQ_FAILED и т.п. не рвут соединение
                        tracing::warn!(nsqd = %addr, error = %String::from_utf8_lossy(&data), "error frame");
                    }
                    Frame::Message(raw) => {
                        let msg = Message::from_wire(raw, addr.clone(), responder.clone());
                        if let Err(mpsc::error::SendError(msg)) = incoming.send(msg).await {
                            tracing::debug!(nsqd = %addr, id = %msg.id, "no handlers left, requeueing");
                        }
                    }
                }
            }
        }
    }
}

async fn write_loop(
    addr: Arc<str>,
    mut writer: Writer,
    mut commands: mpsc::UnboundedReceiver<Command>,
    stop: CancellationToken,
    cfg: Arc<ConsumerConfig>,
) {
    loop {
        let cmd = tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            _ = stop.cancelled() => break,
        };
        let name = cmd.name();
        match tokio::time::timeout(cfg.write_timeout, writer.send(cmd)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(nsqd = %addr, command = name, error = %e, "write error");
                break;
            }
            Err(_) => {
                tracing::error!(nsqd = %addr, command = name, "write timed out");
                break;
            }
        }
    }
    // Сигнал reader'у, если писатель умер раньше
    stop.cancel();
    let _ = writer.close().await;
}
