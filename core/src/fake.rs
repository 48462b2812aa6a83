//! An in-memory stand-in for the X server and for the engine's host.

use rustc_hash::{FxHashMap, FxHashSet};
use x11rb::{
    protocol::{
        ErrorKind,
        xproto::{
            Atom, ClientMessageEvent, EventMask, PropMode, SelectionNotifyEvent, Timestamp, Window,
        },
    },
    x11_utils::X11Error,
};

use crate::{Error, Host, PropertyValue, ProtocolAtoms, Result, Transport};

pub const ROOT: Window = 1;
pub const UTF8_STRING: Atom = 400;
pub const TEXT: Atom = 401;
pub const IMAGE_PNG: Atom = 402;
pub const SAVE_PROPERTY: Atom = 410;
pub const PASTE_PROPERTY: Atom = 411;

pub fn atoms() -> ProtocolAtoms {
    ProtocolAtoms {
        CLIPBOARD: 300,
        CLIPBOARD_MANAGER: 301,
        TARGETS: 302,
        MULTIPLE: 303,
        TIMESTAMP: 304,
        SAVE_TARGETS: 305,
        ATOM_PAIR: 306,
        INCR: 307,
        DELETE: 308,
        INSERT_PROPERTY: 309,
        INSERT_SELECTION: 310,
        PIXMAP: 20,
        MANAGER: 311,
        NULL: 312,
        ATOM: 4,
        INTEGER: 19,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyChange {
    pub mode: PropMode,
    pub window: Window,
    pub property: Atom,
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConvertRequest {
    pub requestor: Window,
    pub selection: Atom,
    pub target: Atom,
    pub property: Atom,
    pub time: Timestamp,
}

struct FakeWindow {
    mask: EventMask,
    properties: FxHashMap<Atom, PropertyValue>,
}

pub struct FakeServer {
    next_id: Window,
    time: Timestamp,
    windows: FxHashMap<Window, FakeWindow>,
    owners: FxHashMap<Atom, Window>,

    /// Selections some other client holds and will not give up.
    pub contested: Vec<Atom>,
    /// Properties whose reads fail with a protocol error.
    pub broken_properties: Vec<(Window, Atom)>,
    /// Makes every window destruction fail with a protocol error.
    pub destroy_fails: bool,

    pub changes: Vec<PropertyChange>,
    pub conversions: Vec<ConvertRequest>,
    pub notifies: Vec<SelectionNotifyEvent>,
    pub client_messages: Vec<(Window, EventMask, ClientMessageEvent)>,
}

fn x11_error(error_kind: ErrorKind, bad_value: u32) -> Error {
    Error::X11(X11Error {
        error_kind,
        error_code: 0,
        sequence: 0,
        bad_value,
        minor_opcode: 0,
        major_opcode: 0,
        extension_name: None,
        request_name: None,
    })
}

impl FakeServer {
    pub fn new() -> Self {
        let mut windows = FxHashMap::default();
        windows.insert(
            ROOT,
            FakeWindow {
                mask: EventMask::NO_EVENT,
                properties: FxHashMap::default(),
            },
        );
        Self {
            next_id: 0x20_0000,
            time: 1000,
            windows,
            owners: FxHashMap::default(),
            contested: Vec::new(),
            broken_properties: Vec::new(),
            destroy_fails: false,
            changes: Vec::new(),
            conversions: Vec::new(),
            notifies: Vec::new(),
            client_messages: Vec::new(),
        }
    }

    pub fn add_client_window(&mut self) -> Window {
        let window = self.next_id;
        self.next_id += 1;
        self.windows.insert(
            window,
            FakeWindow {
                mask: EventMask::NO_EVENT,
                properties: FxHashMap::default(),
            },
        );
        window
    }

    pub fn destroy_client_window(&mut self, window: Window) {
        self.windows.remove(&window);
    }

    pub fn mask(&self, window: Window) -> Option<EventMask> {
        self.windows.get(&window).map(|w| w.mask)
    }

    /// Writes a property as another client would, without recording it.
    pub fn put_property(
        &mut self,
        window: Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: &[u8],
    ) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.properties.insert(
                property,
                PropertyValue {
                    type_,
                    format,
                    data: data.to_vec(),
                },
            );
        }
    }

    pub fn property(&self, window: Window, property: Atom) -> Option<&PropertyValue> {
        self.windows
            .get(&window)
            .and_then(|w| w.properties.get(&property))
    }

    pub fn owner(&self, selection: Atom) -> Window {
        self.owners.get(&selection).copied().unwrap_or(x11rb::NONE)
    }

    pub fn force_owner(&mut self, selection: Atom, owner: Window) {
        self.owners.insert(selection, owner);
    }

    pub fn notifies_to(&self, requestor: Window) -> Vec<SelectionNotifyEvent> {
        self.notifies
            .iter()
            .filter(|n| n.requestor == requestor)
            .cloned()
            .collect()
    }

    pub fn changes_to(&self, window: Window, property: Atom) -> Vec<&PropertyChange> {
        self.changes
            .iter()
            .filter(|c| c.window == window && c.property == property)
            .collect()
    }

    fn window_mut(&mut self, window: Window) -> Result<&mut FakeWindow> {
        self.windows
            .get_mut(&window)
            .ok_or_else(|| x11_error(ErrorKind::Window, window))
    }
}

impl Transport for FakeServer {
    fn root(&self) -> Window {
        ROOT
    }

    fn create_window(&mut self) -> Result<Window> {
        Ok(self.add_client_window())
    }

    fn destroy_window(&mut self, window: Window) -> Result<()> {
        if self.destroy_fails {
            return Err(x11_error(ErrorKind::Window, window));
        }
        self.windows
            .remove(&window)
            .map(|_| ())
            .ok_or_else(|| x11_error(ErrorKind::Window, window))
    }

    fn select_input(&mut self, window: Window, mask: EventMask) -> Result<()> {
        self.window_mut(window)?.mask = mask;
        Ok(())
    }

    fn event_mask(&mut self, window: Window) -> Result<EventMask> {
        Ok(self.window_mut(window)?.mask)
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
        let target = self.window_mut(window)?;
        let value = target
            .properties
            .entry(property)
            .or_insert_with(|| PropertyValue {
                type_,
                format,
                data: Vec::new(),
            });
        if mode == PropMode::REPLACE {
            *value = PropertyValue {
                type_,
                format,
                data: data.to_vec(),
            };
        } else if value.type_ != type_ || value.format != format {
            return Err(x11_error(ErrorKind::Match, property));
        } else if mode == PropMode::APPEND {
            value.data.extend_from_slice(data);
        } else {
            value.data.splice(0..0, data.iter().copied());
        }

        self.changes.push(PropertyChange {
            mode,
            window,
            property,
            type_,
            format,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn get_property(
        &mut self,
        delete: bool,
        window: Window,
        property: Atom,
        type_: Atom,
    ) -> Result<PropertyValue> {
        if self.broken_properties.contains(&(window, property)) {
            return Err(x11_error(ErrorKind::Atom, property));
        }
        let target = self.window_mut(window)?;
        let Some(value) = target.properties.get(&property) else {
            return Ok(PropertyValue::default());
        };
        if type_ != x11rb::NONE && type_ != value.type_ {
            return Ok(PropertyValue {
                type_: value.type_,
                format: value.format,
                data: Vec::new(),
            });
        }

        let value = value.clone();
        if delete {
            target.properties.remove(&property);
        }
        Ok(value)
    }

    fn convert_selection(
        &mut self,
        requestor: Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: Timestamp,
    ) -> Result<()> {
        self.window_mut(requestor)?;
        self.conversions.push(ConvertRequest {
            requestor,
            selection,
            target,
            property,
            time,
        });
        Ok(())
    }

    fn set_selection_owner(
        &mut self,
        owner: Window,
        selection: Atom,
        _time: Timestamp,
    ) -> Result<()> {
        if owner != x11rb::NONE {
            self.window_mut(owner)?;
        }
        if self.contested.contains(&selection) {
            return Ok(());
        }
        if owner == x11rb::NONE {
            self.owners.remove(&selection);
        } else {
            self.owners.insert(selection, owner);
        }
        Ok(())
    }

    fn selection_owner(&mut self, selection: Atom) -> Result<Window> {
        Ok(self.owner(selection))
    }

    fn send_selection_notify(&mut self, notify: SelectionNotifyEvent) -> Result<()> {
        self.window_mut(notify.requestor)?;
        self.notifies.push(notify);
        Ok(())
    }

    fn send_client_message(
        &mut self,
        destination: Window,
        mask: EventMask,
        message: ClientMessageEvent,
    ) -> Result<()> {
        self.window_mut(destination)?;
        self.client_messages.push((destination, mask, message));
        Ok(())
    }

    fn server_time(&mut self, window: Window) -> Result<Timestamp> {
        self.window_mut(window)?;
        self.time += 1;
        Ok(self.time)
    }
}

#[derive(Default, Debug)]
pub struct RecordingHost {
    pub watching: FxHashSet<Window>,
    pub terminations: usize,
    pub trap_depth: usize,
    pub traps: usize,
}

impl Host for RecordingHost {
    fn watch(&mut self, window: Window, start: bool, _mask: EventMask) {
        if start {
            self.watching.insert(window);
        } else {
            self.watching.remove(&window);
        }
    }

    fn terminate(&mut self) {
        self.terminations += 1;
    }

    fn error_trap_push(&mut self) {
        self.trap_depth += 1;
        self.traps += 1;
    }

    fn error_trap_pop(&mut self) -> std::result::Result<(), X11Error> {
        self.trap_depth -= 1;
        Ok(())
    }
}
