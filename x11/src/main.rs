use std::{borrow::Cow, io, path::PathBuf};

use clipboard_manager::{ClipboardManager, Error, ProtocolAtoms, is_manager_running};
use error_stack::Report;
use log::{debug, info, trace, warn};
use rustix::event::epoll;
use thiserror::Error;
use x11rb::{
    connection::Connection,
    errors::{ConnectError, ConnectionError, ReplyError},
    protocol::Event,
    x11_utils::X11Error,
};

use crate::connection::{DaemonAtoms, DaemonHost, XConnection};

mod config;
mod connection;

#[derive(Error, Debug)]
enum CliError {
    #[error("{0}")]
    Core(#[from] Error),
    #[error("{context}")]
    Io {
        error: io::Error,
        context: Cow<'static, str>,
    },
    #[error("invalid config file: {file:?}")]
    Config {
        error: toml::de::Error,
        file: PathBuf,
    },
    #[error("failed to connect to X11 server")]
    X11Connect(#[from] ConnectError),
    #[error("X11 request failed")]
    X11Connection(#[from] ConnectionError),
    #[error("X11 reply failed")]
    X11Error(X11Error),
}

impl From<X11Error> for CliError {
    fn from(value: X11Error) -> Self {
        Self::X11Error(value)
    }
}

impl From<ReplyError> for CliError {
    fn from(value: ReplyError) -> Self {
        match value {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => e.into(),
        }
    }
}

trait IoErr<Out> {
    fn map_io_err<I: Into<Cow<'static, str>>>(self, f: impl FnOnce() -> I) -> Out;
}

impl<T> IoErr<Result<T, CliError>> for Result<T, io::Error> {
    fn map_io_err<I: Into<Cow<'static, str>>>(
        self,
        context: impl FnOnce() -> I,
    ) -> Result<T, CliError> {
        self.map_err(|error| CliError::Io {
            error,
            context: context().into(),
        })
    }
}

impl<T> IoErr<Result<T, CliError>> for rustix::io::Result<T> {
    fn map_io_err<I: Into<Cow<'static, str>>>(
        self,
        context: impl FnOnce() -> I,
    ) -> Result<T, CliError> {
        self.map_err(io::Error::from).map_io_err(context)
    }
}

#[derive(Error, Debug)]
enum Wrapper {
    #[error("{0}")]
    W(String),
}

fn main() -> error_stack::Result<(), Wrapper> {
    #[cfg(not(debug_assertions))]
    error_stack::Report::install_debug_hook::<std::panic::Location>(|_, _| {});

    if cfg!(debug_assertions) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::init();
    }

    run().map_err(into_report)
}

fn into_report(cli_err: CliError) -> Report<Wrapper> {
    let wrapper = Wrapper::W(cli_err.to_string());
    match cli_err {
        CliError::Core(e) => e.into_report(wrapper),
        CliError::Io { error, context } => Report::new(error)
            .attach_printable(context)
            .change_context(wrapper),
        CliError::Config { error, file: _ } => Report::new(error).change_context(wrapper),
        CliError::X11Connect(e) => Report::new(e).change_context(wrapper),
        CliError::X11Connection(e) => Report::new(e).change_context(wrapper),
        CliError::X11Error(e) => Report::new(wrapper).attach_printable(format!("{e:?}")),
    }
}

fn run() -> Result<(), CliError> {
    info!(
        "Starting X11 clipboard manager v{}.",
        env!("CARGO_PKG_VERSION")
    );

    let config = config::load()?;

    let (conn, root) = {
        let (conn, screen_num) = x11rb::connect(config.display.as_deref())?;
        let root = conn.setup().roots[screen_num].root;

        (conn, root)
    };
    debug!("X11 connection established.");

    let atoms_cookie = ProtocolAtoms::new(&conn)?;
    let daemon_atoms = DaemonAtoms::new(&conn)?.reply()?;
    let atoms = atoms_cookie.reply()?;
    debug!("Atom internment complete.");

    let mut transport = XConnection::new(conn, root, daemon_atoms);
    if is_manager_running(&mut transport, &atoms)? {
        warn!("Another clipboard manager is already running, exiting.");
        return Ok(());
    }

    let selection_max_size = config
        .selection_max_size
        .unwrap_or_else(|| transport.selection_max_size());
    debug!("Sending selections larger than {selection_max_size} bytes incrementally.");

    let mut manager =
        ClipboardManager::new(transport, DaemonHost::default(), atoms, selection_max_size)?;

    let epoll =
        epoll::create(epoll::CreateFlags::CLOEXEC).map_io_err(|| "Failed to create epoll.")?;
    epoll::add(
        &epoll,
        manager.transport(),
        epoll::EventData::new_u64(0),
        epoll::EventFlags::IN,
    )
    .map_io_err(|| "Failed to register X11 server with epoll.")?;
    let mut epoll_events = epoll::EventVec::with_capacity(1);

    info!("Starting event loop.");
    loop {
        while let Some(event) = manager.transport_mut().next_event()? {
            handle_x11_event(&mut manager, &event)?;

            if manager.host().is_terminated() {
                info!("Replaced by another clipboard manager, shutting down.");
                debug!(
                    "Dropping {} watched windows and {} pending transfers.",
                    manager.host().watched(),
                    manager.pending_transfers()
                );
                manager.destroy()?;
                return Ok(());
            }
        }
        manager.transport().flush()?;

        trace!("Waiting for event.");
        epoll::wait(&epoll, &mut epoll_events, -1)
            .map_io_err(|| "Failed to wait for epoll events.")?;
    }
}

fn handle_x11_event(
    manager: &mut ClipboardManager<XConnection, DaemonHost>,
    event: &Event,
) -> Result<(), CliError> {
    if let Event::Error(e) = event {
        warn!("Ignoring asynchronous X11 error: {e:?}");
        return Ok(());
    }

    match manager.process_event(event) {
        Ok(true) => {}
        Ok(false) => trace!("Ignoring X11 event: {event:?}"),
        Err(e) if e.is_trappable() => warn!("X11 request failed while handling {event:?}: {e}"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
