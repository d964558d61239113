use super::{Credentials, DeviceServer};
use crate::device::error::DeviceError;
use crate::protocol;
use crate::ClientId;
use log::{debug, error, info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Longest a reply may wait for room in a client's socket before the client is dropped.
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything the serving loop hears about, from every connection, in arrival order.
enum Event {
    Connected {
        client: ClientId,
        cred: Credentials,
        stream: UnixStream,
    },
    Request {
        client: ClientId,
        body: Vec<u8>,
    },
    Disconnected {
        client: ClientId,
    },
}

/// The mount point: a Unix stream socket clients connect to.
#[derive(Debug)]
pub struct Listener {
    listener: UnixListener,
    path: PathBuf,
}

impl Listener {
    /// Binds the socket at `path`, replacing a stale one.
    ///
    /// The socket itself is world-connectable. Access is decided per node when a
    /// connection opens one.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            fs::remove_file(&path).map_err(DeviceError::NamespaceFailed)?;
        }
        let listener = UnixListener::bind(&path).map_err(DeviceError::NamespaceFailed)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))
            .map_err(DeviceError::NamespaceFailed)?;

        info!("serving GPIO namespace at {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serves connections until the listener fails.
    ///
    /// Connections are read on their own threads, but every request is handed to `server`
    /// from this thread, one at a time.
    pub fn serve(self, server: &mut DeviceServer) -> io::Result<()> {
        let (events, requests) = mpsc::channel();
        let listener = self.listener;
        thread::Builder::new()
            .name("gpio-accept".into())
            .spawn(move || accept_loop(listener, events))?;

        let mut writers = HashMap::new();
        for event in requests {
            match event {
                Event::Connected {
                    client,
                    cred,
                    stream,
                } => {
                    server.connect(client, cred);
                    writers.insert(client, stream);
                }
                Event::Request { client, body } => {
                    let stream = match writers.get_mut(&client) {
                        Some(stream) => stream,
                        // Already dropped, the rest of its queue is discarded.
                        None => continue,
                    };
                    let reply = protocol::encode_reply(&server.handle(client, &body));
                    if let Err(err) = protocol::write_frame(stream, &reply) {
                        warn!("dropping client {}, reply failed: {}", client, err);
                        let _ = stream.shutdown(Shutdown::Both);
                        writers.remove(&client);
                        server.close(client);
                    }
                }
                Event::Disconnected { client } => {
                    if writers.remove(&client).is_some() {
                        server.close(client);
                    }
                }
            }
        }

        Ok(())
    }
}

fn accept_loop(listener: UnixListener, events: Sender<Event>) {
    let mut next_client: ClientId = 1;

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!("accept failed: {}", err);
                thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        let cred = match getsockopt(&stream, PeerCredentials) {
            Ok(cred) => Credentials {
                uid: cred.uid(),
                gid: cred.gid(),
            },
            Err(err) => {
                warn!("dropping connection without peer credentials: {}", err);
                continue;
            }
        };
        if let Err(err) = stream.set_write_timeout(Some(REPLY_TIMEOUT)) {
            warn!("dropping connection: {}", err);
            continue;
        }
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                warn!("dropping connection: {}", err);
                continue;
            }
        };

        let client = next_client;
        next_client += 1;

        if events
            .send(Event::Connected {
                client,
                cred,
                stream,
            })
            .is_err()
        {
            break;
        }

        let client_events = events.clone();
        let spawned = thread::Builder::new()
            .name(format!("gpio-client-{}", client))
            .spawn(move || read_loop(client, reader, client_events));
        if let Err(err) = spawned {
            warn!("no reader thread for client {}: {}", client, err);
            let _ = events.send(Event::Disconnected { client });
        }
    }
}

fn read_loop(client: ClientId, mut stream: UnixStream, events: Sender<Event>) {
    loop {
        match protocol::read_frame(&mut stream) {
            Ok(Some(body)) => {
                if events.send(Event::Request { client, body }).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!("client {} read failed: {}", client, err);
                break;
            }
        }
    }

    let _ = events.send(Event::Disconnected { client });
}
