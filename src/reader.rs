use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use log::warn;

use crate::controller::ControlEvent;
use crate::proto::command::Notification;
use crate::proto::frame::{Frame, FrameDecoder, Response};

/// Drains the transport read half: decodes frames and routes them by
/// discriminator. Responses feed the command engine, events feed the
/// controller queue in arrival order.
pub fn spawn_reader<R>(
    mut port: R,
    responses: Sender<Response>,
    events: Sender<ControlEvent>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 512];
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let n = match port.read(&mut chunk) {
                Ok(0) => {
                    let _ = events.send(ControlEvent::TransportDown("end of stream".into()));
                    return;
                }
                Ok(n) => n,
                // The port read timeout doubles as the stop-flag poll tick.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = events.send(ControlEvent::TransportDown(e.to_string()));
                    return;
                }
            };
            decoder.extend(&chunk[..n]);
            while let Some(item) = decoder.next_frame() {
                match item {
                    Ok(Frame::Response(resp)) => {
                        if responses.send(resp).is_err() {
                            return; // engine is gone, session is over
                        }
                    }
                    Ok(Frame::Event(ev)) => match Notification::from_event(&ev) {
                        Ok(note) => {
                            if events.send(ControlEvent::Notify(note)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("bad {} event: {}", ev.name, e),
                    },
                    // Malformed frames are dropped here; the decoder resyncs
                    // on the next line by itself.
                    Err(e) => warn!("dropping malformed frame: {}", e),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    fn frame_line(disc: &str, body: &str) -> String {
        format!("{},{:04X},{}\r\n", disc, body.len(), body)
    }

    #[test]
    fn routes_by_discriminator_and_reports_eof() {
        let mut input = String::new();
        input.push_str(&frame_line("@R", "/CA,0000"));
        input.push_str(&frame_line("@E", "AR,D=07FF09000000002A"));
        input.push_str("not a frame at all\r\n");
        input.push_str(&frame_line("@E", "AR,D=07FF09000000002B"));

        let (resp_tx, resp_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(
            Cursor::new(input.into_bytes()),
            resp_tx,
            event_tx,
            Arc::clone(&stop),
        );
        handle.join().unwrap();

        let resp = resp_rx.recv().unwrap();
        assert_eq!(resp.opcode, "/CA");
        assert!(resp_rx.recv().is_err());

        // Two notifications in arrival order, then the end-of-stream event.
        // The garbage line is dropped without producing anything.
        assert!(matches!(
            event_rx.recv().unwrap(),
            ControlEvent::Notify(Notification::AdvReport { .. })
        ));
        assert!(matches!(
            event_rx.recv().unwrap(),
            ControlEvent::Notify(Notification::AdvReport { .. })
        ));
        assert!(matches!(
            event_rx.recv().unwrap(),
            ControlEvent::TransportDown(_)
        ));
        assert!(event_rx.recv().is_err());
    }

    #[test]
    fn stop_flag_ends_the_thread() {
        // A reader whose transport always times out must still exit.
        struct AlwaysTimedOut;
        impl Read for AlwaysTimedOut {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                std::thread::sleep(std::time::Duration::from_millis(5));
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "poll"))
            }
        }

        let (resp_tx, _resp_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(AlwaysTimedOut, resp_tx, event_tx, Arc::clone(&stop));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        // A clean stop is not a transport failure.
        assert!(event_rx.try_recv().is_err());
    }
}
