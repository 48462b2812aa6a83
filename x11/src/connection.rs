use std::{
    collections::VecDeque,
    os::fd::{AsFd, BorrowedFd},
};

use clipboard_manager::{Host, PropertyValue, Result, Transport};
use log::{debug, trace};
use rustc_hash::FxHashSet;
use x11rb::{
    atom_manager,
    connection::{Connection, RequestConnection},
    protocol::{
        Event,
        xproto::{
            Atom, ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt, CreateWindowAux,
            EventMask, PropMode, SelectionNotifyEvent, Timestamp, Window, WindowClass,
        },
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as WrapperConnExt,
};

atom_manager! {
    pub DaemonAtoms:
    DaemonAtomsCookie {
        _NET_WM_NAME,
        UTF8_STRING,
        _TIMESTAMP_PROP,
    }
}

/// Requests are checked one by one, so protocol errors surface from the call
/// that caused them.
pub struct XConnection {
    conn: RustConnection,
    root: Window,
    atoms: DaemonAtoms,
    deferred: VecDeque<Event>,
}

impl XConnection {
    pub const fn new(conn: RustConnection, root: Window, atoms: DaemonAtoms) -> Self {
        Self {
            conn,
            root,
            atoms,
            deferred: VecDeque::new(),
        }
    }

    /// Largest property payload that fits in one request, leaving room for
    /// the request header.
    pub fn selection_max_size(&self) -> usize {
        const HEADER_ALLOWANCE: usize = 100 * 4;
        const CAP: usize = 256 * 1024;

        self.conn
            .maximum_request_bytes()
            .saturating_sub(HEADER_ALLOWANCE)
            .min(CAP)
    }

    /// The next event, starting with those set aside while waiting for a
    /// server timestamp.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        if let Some(event) = self.deferred.pop_front() {
            return Ok(Some(event));
        }
        Ok(self.conn.poll_for_event()?)
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.conn.flush()?)
    }
}

impl AsFd for XConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.conn.stream().as_fd()
    }
}

impl Transport for XConnection {
    fn root(&self) -> Window {
        self.root
    }

    fn create_window(&mut self) -> Result<Window> {
        let window = self.conn.generate_id()?;
        self.conn
            .create_window(
                x11rb::COPY_DEPTH_FROM_PARENT,
                window,
                self.root,
                0,
                0,
                1,
                1,
                0,
                WindowClass::INPUT_ONLY,
                x11rb::COPY_FROM_PARENT,
                &CreateWindowAux::default(),
            )?
            .check()?;
        self.conn
            .change_property8(
                PropMode::REPLACE,
                window,
                self.atoms._NET_WM_NAME,
                self.atoms.UTF8_STRING,
                b"Clipboard manager",
            )?
            .check()?;
        Ok(window)
    }

    fn destroy_window(&mut self, window: Window) -> Result<()> {
        self.conn.destroy_window(window)?.check()?;
        Ok(())
    }

    fn select_input(&mut self, window: Window, mask: EventMask) -> Result<()> {
        self.conn
            .change_window_attributes(window, &ChangeWindowAttributesAux::new().event_mask(mask))?
            .check()?;
        Ok(())
    }

    fn event_mask(&mut self, window: Window) -> Result<EventMask> {
        Ok(self
            .conn
            .get_window_attributes(window)?
            .reply()?
            .your_event_mask)
    }

    fn change_property(
        &mut self,
        mode: PropMode,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) -> Result<()> {
        let items = data.len() / usize::from((format / 8).max(1));
        self.conn
            .change_property(
                mode,
                window,
                property,
                type_,
                format,
                u32::try_from(items).unwrap_or(u32::MAX),
                data,
            )?
            .check()?;
        Ok(())
    }

    fn get_property(
        &mut self,
        delete: bool,
        window: Window,
        property: Atom,
        type_: Atom,
    ) -> Result<PropertyValue> {
        let reply = self
            .conn
            .get_property(delete, window, property, type_, 0, u32::MAX)?
            .reply()?;
        Ok(PropertyValue {
            type_: reply.type_,
            format: reply.format,
            data: reply.value,
        })
    }

    fn convert_selection(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()> {
        self.conn
            .convert_selection(requestor, selection, target, property, time)?
            .check()?;
        Ok(())
    }

    fn set_selection_owner(
        &mut self,
        owner: Window,
        selection: Atom,
        time: Timestamp,
    ) -> Result<()> {
        self.conn
            .set_selection_owner(owner, selection, time)?
            .check()?;
        Ok(())
    }

    fn selection_owner(&mut self, selection: Atom) -> Result<Window> {
        Ok(self.conn.get_selection_owner(selection)?.reply()?.owner)
    }

    fn send_selection_notify(&mut self, notify: SelectionNotifyEvent) -> Result<()> {
        self.conn
            .send_event(false, notify.requestor, EventMask::NO_EVENT, notify)?
            .check()?;
        Ok(())
    }

    fn send_client_message(
        &mut self,
        destination: Window,
        mask: EventMask,
        message: ClientMessageEvent,
    ) -> Result<()> {
        self.conn
            .send_event(false, destination, mask, message)?
            .check()?;
        Ok(())
    }

    fn server_time(&mut self, window: Window) -> Result<Timestamp> {
        let atom = self.atoms._TIMESTAMP_PROP;
        self.conn
            .change_property8(PropMode::REPLACE, window, atom, atom, b"a")?
            .check()?;

        loop {
            match self.conn.wait_for_event()? {
                Event::PropertyNotify(event) if event.window == window && event.atom == atom => {
                    trace!("Server time is {}.", event.time);
                    return Ok(event.time);
                }
                event => self.deferred.push_back(event),
            }
        }
    }
}

/// Tracks which windows the engine cares about and whether it gave up.
#[derive(Default, Debug)]
pub struct DaemonHost {
    watched: FxHashSet<Window>,
    terminated: bool,
}

impl DaemonHost {
    pub fn watched(&self) -> usize {
        self.watched.len()
    }

    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Host for DaemonHost {
    fn watch(&mut self, window: Window, start: bool, mask: EventMask) {
        if start {
            if self.watched.insert(window) {
                debug!("Watching window {window} for {mask:?}.");
            }
        } else if self.watched.remove(&window) {
            debug!("No longer watching window {window}.");
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}
