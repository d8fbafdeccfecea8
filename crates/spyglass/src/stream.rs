use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::encoder::{Connection, ConnectionLost};
use crate::{STREAM_CONNECT_ATTEMPTS, STREAM_MAX_QUEUED_FRAMES, STREAM_RECONNECT_DELAY_MS};

/// Runs `fut` on the ambient tokio runtime if there is one, otherwise on a
/// dedicated current-thread runtime on its own thread.
pub(crate) fn spawn_background<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
        return;
    }

    std::thread::spawn(move || {
        if let Ok(rt) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            rt.block_on(fut);
        }
    });
}

struct StreamQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    lost: AtomicBool,
}

/// Connection backed by a TCP stream to the analysis tool.
///
/// `send` only appends to an in-process queue, so intercepted calls never
/// block on the network; a background task drains the queue in order,
/// writing the protocol magic before the first frame. Any write failure (or
/// queue overflow) marks the connection lost, permanently — the dispatcher
/// degrades to cheap-path no-ops from then on.
pub struct StreamConnection {
    queue: Arc<StreamQueue>,
}

impl StreamConnection {
    pub fn connect(addr: &str) -> Self {
        let queue = Arc::new(StreamQueue {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            lost: AtomicBool::new(false),
        });
        let task_queue = Arc::clone(&queue);
        let addr = addr.to_string();
        spawn_background(async move {
            run_stream_push_loop(addr, task_queue).await;
        });
        Self { queue }
    }
}

impl Connection for StreamConnection {
    fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionLost> {
        if self.queue.lost.load(Ordering::Acquire) {
            return Err(ConnectionLost);
        }
        {
            let mut frames = self.queue.frames.lock();
            if frames.len() >= STREAM_MAX_QUEUED_FRAMES {
                // The push loop cannot keep up; dropping frames would corrupt
                // the stream order, so the whole connection goes down instead.
                self.queue.lost.store(true, Ordering::Release);
                return Err(ConnectionLost);
            }
            frames.push_back(frame.to_vec());
        }
        self.queue.notify.notify_one();
        Ok(())
    }
}

async fn run_stream_push_loop(addr: String, queue: Arc<StreamQueue>) {
    let Some(mut stream) = connect_with_retry(&addr).await else {
        queue.lost.store(true, Ordering::Release);
        return;
    };

    if stream
        .write_all(&spyglass_wire::encode_protocol_magic())
        .await
        .is_err()
    {
        queue.lost.store(true, Ordering::Release);
        return;
    }

    loop {
        let frame = { queue.frames.lock().pop_front() };
        match frame {
            Some(frame) => {
                if let Err(err) = stream.write_all(&frame).await {
                    tracing::warn!(error = %err, "trace stream write failed");
                    queue.lost.store(true, Ordering::Release);
                    return;
                }
            }
            None => queue.notify.notified().await,
        }
    }
}

async fn connect_with_retry(addr: &str) -> Option<TcpStream> {
    for attempt in 1..=STREAM_CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Some(stream),
            Err(err) => {
                tracing::debug!(%addr, attempt, error = %err, "trace stream connect failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(STREAM_RECONNECT_DELAY_MS)).await;
    }
    tracing::warn!(%addr, "giving up on trace stream connection");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_types::TraceHeader;
    use spyglass_wire::{ClientMessage, encode_client_message_default};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_arrive_after_the_protocol_magic() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");

        let mut connection = StreamConnection::connect(&addr.to_string());
        let frame = encode_client_message_default(&ClientMessage::Header(TraceHeader {
            process_name: "quadbench".into(),
            pid: 7,
            capture_frames: 1,
            observe_frame_frequency: 0,
            observe_draw_frequency: 0,
        }))
        .expect("message should encode");
        connection.send(&frame).expect("send should queue");

        let (mut peer, _) = listener.accept().await.expect("peer should connect");

        let mut magic = [0u8; 4];
        peer.read_exact(&mut magic)
            .await
            .expect("magic should arrive");
        spyglass_wire::decode_protocol_magic(magic).expect("magic should decode");

        let mut received = vec![0u8; frame.len()];
        peer.read_exact(&mut received)
            .await
            .expect("frame should arrive");
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn unreachable_peer_eventually_marks_the_connection_lost() {
        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an addr");
        drop(listener);

        let queue = Arc::new(StreamQueue {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            lost: AtomicBool::new(false),
        });
        let task_queue = Arc::clone(&queue);

        // Exercise the loop directly with time paused so the retry delays
        // elapse instantly.
        tokio::time::pause();
        run_stream_push_loop(addr.to_string(), task_queue).await;
        assert!(queue.lost.load(Ordering::Acquire));

        let mut connection = StreamConnection {
            queue: Arc::clone(&queue),
        };
        assert_eq!(connection.send(b"frame"), Err(ConnectionLost));
    }
}
