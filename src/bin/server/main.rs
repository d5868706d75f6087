use std::{
    fs::{self, Permissions},
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpListener,
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::UnixListener,
    },
    path::{Path, PathBuf},
    process,
    sync::Arc,
    thread,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::channel::{bounded, never};
use gfn_to_pfn::{
    config,
    session::{Endpoint, WRITE_MAX},
    virt_to_phys::PagemapResolver,
};
use log::{debug, error, info, warn};
use nix::{
    fcntl::OFlag,
    sys::stat::{umask, Mode},
};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "./gfn-config.toml")]
    config_path: String,
    /// Serve on this unix socket instead of the one from the config file
    #[arg(long)]
    socket: Option<String>,
}

/// Serve one connection as one session: every request line received is written to the
/// session and the reply read back is sent to the peer.
fn serve_connection<S: Read + Write>(stream: S, endpoint: &Arc<Endpoint>) -> Result<()> {
    let session = endpoint.open(OFlag::O_RDWR, never());
    let mut reader = BufReader::new(stream);
    let mut request = Vec::with_capacity(WRITE_MAX);

    loop {
        request.clear();
        let n = (&mut reader)
            .take(WRITE_MAX as u64)
            .read_until(b'\n', &mut request)
            .context("failed to receive request")?;
        if n == 0 {
            break;
        }

        session
            .write(&request)
            .context("endpoint rejected request")?;
        let reply = session.read_reply().context("failed to read reply")?;
        reader
            .get_mut()
            .write_all(&reply)
            .context("failed to send reply")?;
    }

    session.close();
    Ok(())
}

fn accept_loop<S, I>(incoming: I, endpoint: Arc<Endpoint>)
where
    I: Iterator<Item = io::Result<S>>,
    S: Read + Write + Send + 'static,
{
    for stream in incoming {
        match stream {
            Ok(stream) => {
                let endpoint = endpoint.clone();
                thread::spawn(move || {
                    debug!("accepted connection");
                    if let Err(e) = serve_connection(stream, &endpoint) {
                        warn!("closing connection : {:#}", e);
                    }
                });
            }
            Err(e) => error!("failed to accept connection : {}", e),
        }
    }
}

/// Bind the endpoint socket at `path` with file mode `mode`. A stale socket left at `path`
/// is replaced, anything else there is an error.
fn bind_socket(path: &Path, mode: u32) -> Result<UnixListener> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("removing stale socket {:?}", path);
            fs::remove_file(path).context(format!("failed to remove stale socket {:?}", path))?;
        }
        Ok(_) => bail!("{:?} exists and is not a socket", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e).context(format!("failed to stat {:?}", path)),
    }

    //the socket must never be reachable with a wider mode than requested
    let old_umask = umask(Mode::from_bits_truncate(!mode & 0o777));
    let bound = UnixListener::bind(path);
    umask(old_umask);
    let listener = bound.context(format!("failed to bind unix socket {:?}", path))?;

    fs::set_permissions(path, Permissions::from_mode(mode))
        .context(format!("failed to set mode {:o} on {:?}", mode, path))?;
    Ok(listener)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = CliArgs::parse();
    let mut config =
        config::parse_config(&args.config_path).context("failed to parse config")?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let registry = config.registry().context("invalid vm configuration")?;
    info!("{} vm(s) registered", registry.len());
    let endpoint = Endpoint::new(registry, Arc::new(PagemapResolver::new()));

    let socket_path = PathBuf::from(&config.socket_path);
    let listener = bind_socket(&socket_path, config.socket_mode)?;
    info!(
        "listening on {:?} with mode {:o}",
        socket_path, config.socket_mode
    );

    //mapping ctrl-c to channel
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || tx.send(()).expect("Could not send signal on channel."))
        .expect("Error setting Ctrl-C handler");
    {
        let socket_path = socket_path.clone();
        thread::spawn(move || {
            if rx.recv().is_ok() {
                info!("shutting down");
                if let Err(e) = fs::remove_file(&socket_path) {
                    error!("failed to remove {:?} : {}", socket_path, e);
                }
                process::exit(0);
            }
        });
    }

    if let Some(tcp_address) = &config.tcp_address {
        let tcp_listener = TcpListener::bind(tcp_address)
            .context(format!("failed to listen on {}", tcp_address))?;
        info!("listening on tcp {}", tcp_address);
        let endpoint = endpoint.clone();
        thread::spawn(move || accept_loop(tcp_listener.incoming(), endpoint));
    }

    accept_loop(listener.incoming(), endpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Result;
    use gfn_to_pfn::registry::MemoryRegistry;

    use super::*;

    /// In-memory duplex stream: reads from `input`, collects writes in `output`
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn endpoint() -> Arc<Endpoint> {
        Endpoint::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(PagemapResolver::new()),
        )
    }

    #[test]
    fn one_reply_per_request_line() -> Result<()> {
        let mut stream = Duplex {
            input: Cursor::new(b"0x1000\nbogus\n0x1000 42".to_vec()),
            output: Vec::new(),
        };
        serve_connection(&mut stream, &endpoint())?;
        assert_eq!(
            String::from_utf8(stream.output)?,
            "err:no_vms\nerr:invalid_input\nerr:no_vm pid=42\n"
        );
        Ok(())
    }

    #[test]
    fn oversized_request_closes_connection() {
        let mut input = vec![b'1'; WRITE_MAX];
        input.push(b'\n');
        let mut stream = Duplex {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        assert!(serve_connection(&mut stream, &endpoint()).is_err());
        assert!(stream.output.is_empty());
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gfn_to_pfn-{}-{}", process::id(), name))
    }

    #[test]
    fn socket_gets_requested_mode() -> Result<()> {
        let path = scratch_path("mode.sock");
        let listener = bind_socket(&path, 0o600)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        drop(listener);

        //left behind by the dropped listener, replaced on the next bind
        assert!(path.exists());
        let _listener = bind_socket(&path, 0o640)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o640);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn refuses_to_replace_regular_file() -> Result<()> {
        let path = scratch_path("not-a-socket");
        fs::write(&path, b"keep me")?;
        assert!(bind_socket(&path, 0o600).is_err());
        assert_eq!(fs::read(&path)?, b"keep me");
        fs::remove_file(&path)?;
        Ok(())
    }
}
