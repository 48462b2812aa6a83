use std::{mem, rc::Rc};

use arrayvec::ArrayVec;
use log::{debug, info, trace, warn};
use rustc_hash::FxHashMap;
use x11rb::protocol::{
    Event,
    xproto::{
        Atom, AtomEnum, ClientMessageEvent, DestroyNotifyEvent, EventMask, PropMode, Property,
        PropertyNotifyEvent, SELECTION_NOTIFY_EVENT, SelectionClearEvent, SelectionNotifyEvent,
        SelectionRequestEvent, Timestamp, Window,
    },
};

use crate::{
    Error, Host, ProtocolAtoms, Result, TargetBuffer, TransferState, Transport,
    target::{SavedTarget, TargetState},
    transport::encode32,
};

/// The `SAVE_TARGETS` request being served.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SaveRequest {
    pub requestor: Window,
    pub property: Atom,
    pub time: Timestamp,
}

/// Progress of the `CLIPBOARD_MANAGER` save-targets protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SaveState {
    #[default]
    Idle,
    /// Asked the `CLIPBOARD` owner for its `TARGETS`.
    AwaitingTargetsList(SaveRequest),
    /// Asked the `CLIPBOARD` owner to convert `targets` through `MULTIPLE`.
    AwaitingMultipleConversion {
        request: SaveRequest,
        targets: Vec<Atom>,
    },
    /// Own `CLIPBOARD`, but some targets are still arriving through `INCR`.
    ReceivingIncrementally(SaveRequest),
}

impl SaveState {
    #[must_use]
    pub const fn request(&self) -> Option<&SaveRequest> {
        match self {
            Self::Idle => None,
            Self::AwaitingTargetsList(request)
            | Self::AwaitingMultipleConversion { request, .. }
            | Self::ReceivingIncrementally(request) => Some(request),
        }
    }
}

/// Whether some client already owns the `CLIPBOARD_MANAGER` selection.
pub fn is_manager_running(transport: &mut impl Transport, atoms: &ProtocolAtoms) -> Result<bool> {
    Ok(transport.selection_owner(atoms.CLIPBOARD_MANAGER)? != x11rb::NONE)
}

fn requested_property(request: &SelectionRequestEvent) -> Atom {
    if request.property == x11rb::NONE {
        debug!("Obsolete client detected.");
        request.target
    } else {
        request.property
    }
}

pub struct ClipboardManager<T: Transport, H: Host> {
    transport: T,
    host: H,
    atoms: ProtocolAtoms,
    selection_max_size: usize,

    window: Window,
    timestamp: Timestamp,
    clipboard_time: Timestamp,

    contents: Vec<SavedTarget>,
    conversions: FxHashMap<(Window, Atom), TransferState>,
    save: SaveState,
    terminated: bool,
}

impl<T: Transport, H: Host> ClipboardManager<T, H> {
    /// Creates the manager window and claims `CLIPBOARD_MANAGER` with it.
    ///
    /// If the selection cannot be claimed the window is destroyed, the host is
    /// told to terminate, and [`Error::ManagerRunning`] is returned.
    pub fn new(
        mut transport: T,
        mut host: H,
        atoms: ProtocolAtoms,
        selection_max_size: usize,
    ) -> Result<Self> {
        let window = transport.create_window()?;
        host.watch(window, true, EventMask::PROPERTY_CHANGE);
        transport.select_input(window, EventMask::PROPERTY_CHANGE)?;
        let timestamp = transport.server_time(window)?;

        transport.set_selection_owner(window, atoms.CLIPBOARD_MANAGER, timestamp)?;
        if transport.selection_owner(atoms.CLIPBOARD_MANAGER)? != window {
            warn!("Failed to claim the CLIPBOARD_MANAGER selection.");
            host.watch(window, false, EventMask::NO_EVENT);
            host.terminate();
            transport.destroy_window(window)?;
            return Err(Error::ManagerRunning);
        }

        let root = transport.root();
        transport.send_client_message(
            root,
            EventMask::STRUCTURE_NOTIFY,
            ClientMessageEvent::new(
                32,
                root,
                atoms.MANAGER,
                [timestamp, atoms.CLIPBOARD_MANAGER, window, 0, 0],
            ),
        )?;
        info!("Claimed the CLIPBOARD_MANAGER selection with window {window}.");

        Ok(Self {
            transport,
            host,
            atoms,
            selection_max_size,
            window,
            timestamp,
            clipboard_time: timestamp,
            contents: Vec::new(),
            conversions: FxHashMap::default(),
            save: SaveState::Idle,
            terminated: false,
        })
    }

    /// Destroys the manager window and drops everything saved or in flight,
    /// handing back the transport and host.
    pub fn destroy(mut self) -> Result<(T, H)> {
        if let Some(request) = self.save.request() {
            self.host.watch(request.requestor, false, EventMask::NO_EVENT);
        }
        for &(requestor, _) in self.conversions.keys() {
            self.host.watch(requestor, false, EventMask::NO_EVENT);
        }
        self.host.watch(self.window, false, EventMask::NO_EVENT);
        self.conversions.clear();
        self.contents.clear();
        self.transport.destroy_window(self.window)?;
        Ok((self.transport, self.host))
    }

    #[must_use]
    pub const fn window(&self) -> Window {
        self.window
    }

    /// Server time at which `CLIPBOARD_MANAGER` was claimed.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub const fn save_state(&self) -> &SaveState {
        &self.save
    }

    /// The client whose `SAVE_TARGETS` request is being served.
    #[must_use]
    pub fn requestor(&self) -> Option<Window> {
        self.save.request().map(|r| r.requestor)
    }

    /// Saved targets, in the order they were requested.
    pub fn targets(&self) -> impl Iterator<Item = Atom> + '_ {
        self.contents.iter().map(|t| t.target)
    }

    /// A completely received target.
    #[must_use]
    pub fn target(&self, target: Atom) -> Option<&Rc<TargetBuffer>> {
        self.contents
            .iter()
            .find(|t| t.target == target)
            .and_then(|t| match &t.state {
                TargetState::Ready(buffer) => Some(buffer),
                TargetState::Incoming { .. } => None,
            })
    }

    #[must_use]
    pub fn owns_clipboard(&self) -> bool {
        !self.contents.is_empty()
    }

    #[must_use]
    pub fn pending_transfers(&self) -> usize {
        self.conversions.len()
    }

    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub const fn host(&self) -> &H {
        &self.host
    }

    pub const fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Handles one event, returning whether it was meant for the manager.
    pub fn process_event(&mut self, event: &Event) -> Result<bool> {
        match event {
            Event::DestroyNotify(event) => self.handle_destroy(event),
            Event::PropertyNotify(event) => {
                if event.state == Property::NEW_VALUE {
                    self.receive_incrementally(event)
                } else {
                    self.send_incrementally(event)
                }
            }
            Event::SelectionClear(event) => self.handle_selection_clear(event),
            Event::SelectionNotify(event) => self.handle_selection_notify(event),
            Event::SelectionRequest(event) => self.handle_selection_request(event),
            _ => Ok(false),
        }
    }

    /// Runs `f` inside a host error trap. Protocol errors end up as `None`;
    /// connection errors still propagate.
    fn trapped<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<Option<R>> {
        self.host.error_trap_push();
        let result = f(self);
        let trap = self.host.error_trap_pop();

        match (result, trap) {
            (Ok(r), Ok(())) => Ok(Some(r)),
            (Err(Error::X11(e)), _) | (Ok(_), Err(e)) => {
                debug!("Trapped X11 error: {e:?}");
                Ok(None)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Stops watching `window` unless a save or a transfer still needs it.
    fn unwatch(&mut self, window: Window) {
        let in_use = self.requestor() == Some(window)
            || self.conversions.keys().any(|&(requestor, _)| requestor == window);
        if !in_use {
            self.host.watch(window, false, EventMask::NO_EVENT);
        }
    }

    fn reply(&mut self, request: &SelectionRequestEvent, property: Atom) -> Result<()> {
        let notify = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: request.time,
            requestor: request.requestor,
            selection: request.selection,
            target: request.target,
            property,
        };
        self.trapped(|this| this.transport.send_selection_notify(notify))?;
        Ok(())
    }

    fn disown_clipboard(&mut self) -> Result<()> {
        debug!("Giving up the CLIPBOARD selection.");
        self.trapped(|this| {
            this.transport
                .set_selection_owner(x11rb::NONE, this.atoms.CLIPBOARD, this.clipboard_time)
        })?;
        Ok(())
    }

    /// Drops all saved targets. Transfers keep their own buffer references.
    fn release_contents(&mut self, still_owner: bool) -> Result<()> {
        if mem::take(&mut self.contents).is_empty() || !still_owner {
            return Ok(());
        }
        self.disown_clipboard()
    }

    fn abandon_save(&mut self) {
        if let Some(request) = mem::take(&mut self.save).request() {
            debug!("Abandoning the save for {}.", request.requestor);
            self.unwatch(request.requestor);
        }
    }

    fn finish_save(&mut self, request: SaveRequest, success: bool) -> Result<()> {
        self.save = SaveState::Idle;
        if success {
            info!("Saved {} clipboard targets.", self.contents.len());
        } else {
            warn!("Failed to save the clipboard for {}.", request.requestor);
        }

        let notify = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: request.time,
            requestor: request.requestor,
            selection: self.atoms.CLIPBOARD_MANAGER,
            target: self.atoms.SAVE_TARGETS,
            property: if success {
                request.property
            } else {
                x11rb::NONE
            },
        };
        self.trapped(|this| this.transport.send_selection_notify(notify))?;
        self.unwatch(request.requestor);
        Ok(())
    }

    fn handle_destroy(&mut self, event: &DestroyNotifyEvent) -> Result<bool> {
        let window = event.window;
        let mut handled = false;

        if self.requestor() == Some(window) {
            info!("Save requestor {window} vanished, dropping its clipboard.");
            self.save = SaveState::Idle;
            self.release_contents(true)?;
            handled = true;
        }

        let transfers = self.conversions.len();
        self.conversions
            .retain(|&(requestor, _), _| requestor != window);
        if self.conversions.len() != transfers {
            debug!(
                "Dropped {} transfers to destroyed window {window}.",
                transfers - self.conversions.len()
            );
            handled = true;
        }

        if handled {
            self.unwatch(window);
        }
        Ok(handled)
    }

    fn handle_selection_clear(&mut self, event: &SelectionClearEvent) -> Result<bool> {
        if event.owner != self.window {
            return Ok(false);
        }

        if event.selection == self.atoms.CLIPBOARD_MANAGER {
            warn!("Lost the CLIPBOARD_MANAGER selection.");
            self.release_contents(true)?;
            self.abandon_save();
            if !mem::replace(&mut self.terminated, true) {
                self.host.terminate();
            }
            Ok(true)
        } else if event.selection == self.atoms.CLIPBOARD {
            info!("Another client took over the CLIPBOARD selection.");
            self.release_contents(false)?;
            self.abandon_save();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn handle_selection_notify(&mut self, event: &SelectionNotifyEvent) -> Result<bool> {
        if event.requestor != self.window || event.selection != self.atoms.CLIPBOARD {
            return Ok(false);
        }

        match mem::take(&mut self.save) {
            SaveState::AwaitingTargetsList(request)
            | SaveState::AwaitingMultipleConversion { request, .. }
                if event.property == x11rb::NONE =>
            {
                debug!("The CLIPBOARD owner refused the conversion.");
                self.finish_save(request, false)?;
            }
            SaveState::AwaitingTargetsList(request) if event.property == self.atoms.TARGETS => {
                let targets = self.trapped(|this| {
                    this.transport.get_property(
                        true,
                        this.window,
                        this.atoms.TARGETS,
                        this.atoms.ATOM,
                    )
                })?;
                if let Some(targets) = targets.and_then(|v| v.atoms()) {
                    self.save_targets(request, &targets)?;
                } else {
                    warn!("Unreadable TARGETS from the CLIPBOARD owner.");
                    self.finish_save(request, false)?;
                }
            }
            SaveState::AwaitingMultipleConversion { request, targets }
                if event.property == self.atoms.MULTIPLE =>
            {
                self.collect_targets(request, &targets, event.time)?;
            }
            state => {
                trace!(
                    "Ignoring selection notification for property {}.",
                    event.property
                );
                self.save = state;
            }
        }
        Ok(true)
    }

    fn handle_selection_request(&mut self, event: &SelectionRequestEvent) -> Result<bool> {
        if event.owner != self.window {
            return Ok(false);
        }

        if event.selection == self.atoms.CLIPBOARD_MANAGER {
            self.convert_clipboard_manager(event)?;
        } else if event.selection == self.atoms.CLIPBOARD {
            self.convert_clipboard(event)?;
        } else {
            debug!("Refusing request for selection {}.", event.selection);
            self.reply(event, x11rb::NONE)?;
        }
        Ok(true)
    }

    fn convert_clipboard_manager(&mut self, event: &SelectionRequestEvent) -> Result<()> {
        if event.target == self.atoms.SAVE_TARGETS {
            return self.start_save(event);
        }

        let property = requested_property(event);
        let written = if event.target == self.atoms.TIMESTAMP {
            let timestamp = self.timestamp;
            self.trapped(|this| {
                this.transport.change_property(
                    PropMode::REPLACE,
                    event.requestor,
                    property,
                    this.atoms.INTEGER,
                    32,
                    &encode32(&[timestamp]),
                )
            })?
        } else if event.target == self.atoms.TARGETS {
            let mut supported = ArrayVec::<_, 3>::new_const();
            supported.push(self.atoms.TARGETS);
            supported.push(self.atoms.TIMESTAMP);
            supported.push(self.atoms.SAVE_TARGETS);
            self.trapped(|this| {
                this.transport.change_property(
                    PropMode::REPLACE,
                    event.requestor,
                    property,
                    this.atoms.ATOM,
                    32,
                    &encode32(&supported),
                )
            })?
        } else {
            debug!("Unsupported CLIPBOARD_MANAGER target {}.", event.target);
            None
        };

        self.reply(event, if written.is_some() { property } else { x11rb::NONE })
    }

    fn start_save(&mut self, event: &SelectionRequestEvent) -> Result<()> {
        let requestor = event.requestor;
        if self.requestor().is_some() || !self.contents.is_empty() {
            debug!("Refusing SAVE_TARGETS from {requestor}: already saving or saved.");
            return self.reply(event, x11rb::NONE);
        }

        let watched = self.trapped(|this| {
            this.host
                .watch(requestor, true, EventMask::STRUCTURE_NOTIFY);
            let mask = this.transport.event_mask(requestor)?;
            this.transport
                .select_input(requestor, mask | EventMask::STRUCTURE_NOTIFY)
        })?;
        if watched.is_none() {
            debug!("SAVE_TARGETS requestor {requestor} is gone.");
            self.unwatch(requestor);
            return Ok(());
        }

        let targets = if event.property == x11rb::NONE {
            None
        } else {
            let value = self.trapped(|this| {
                this.transport
                    .get_property(false, requestor, event.property, this.atoms.ATOM)
            })?;
            let Some(value) = value else {
                // The requestor gets no notification here.
                debug!("Failed to read the SAVE_TARGETS list of {requestor}.");
                self.unwatch(requestor);
                return Ok(());
            };
            if value.is_missing() {
                None
            } else {
                Some(value.atoms().unwrap_or_default())
            }
        };

        let request = SaveRequest {
            requestor,
            property: event.property,
            time: event.time,
        };
        info!("Saving the clipboard for {requestor}.");

        if let Some(targets) = targets {
            return self.save_targets(request, &targets);
        }

        let asked = self.trapped(|this| {
            this.transport.convert_selection(
                this.window,
                this.atoms.CLIPBOARD,
                this.atoms.TARGETS,
                this.atoms.TARGETS,
                request.time,
            )
        })?;
        if asked.is_some() {
            debug!("Asking the CLIPBOARD owner for its targets.");
            self.save = SaveState::AwaitingTargetsList(request);
            Ok(())
        } else {
            self.finish_save(request, false)
        }
    }

    fn save_targets(&mut self, request: SaveRequest, targets: &[Atom]) -> Result<()> {
        let mut wanted = Vec::with_capacity(targets.len());
        for &target in targets {
            if !self.atoms.is_meta_target(target) && !wanted.contains(&target) {
                wanted.push(target);
            }
        }
        if wanted.is_empty() {
            debug!("Nothing worth saving in {} targets.", targets.len());
            return self.finish_save(request, false);
        }

        let pairs = wanted.iter().flat_map(|&t| [t, t]).collect::<Vec<_>>();
        let asked = self.trapped(|this| {
            this.transport.change_property(
                PropMode::REPLACE,
                this.window,
                this.atoms.MULTIPLE,
                this.atoms.ATOM_PAIR,
                32,
                &encode32(&pairs),
            )?;
            this.transport.convert_selection(
                this.window,
                this.atoms.CLIPBOARD,
                this.atoms.MULTIPLE,
                this.atoms.MULTIPLE,
                request.time,
            )
        })?;
        if asked.is_none() {
            return self.finish_save(request, false);
        }

        debug!("Requesting {} targets from the CLIPBOARD owner.", wanted.len());
        self.save = SaveState::AwaitingMultipleConversion {
            request,
            targets: wanted,
        };
        Ok(())
    }

    /// Reads back the targets the owner converted into the manager window.
    fn collect_targets(
        &mut self,
        request: SaveRequest,
        targets: &[Atom],
        time: Timestamp,
    ) -> Result<()> {
        for &target in targets {
            let value = self.trapped(|this| {
                this.transport
                    .get_property(true, this.window, target, AtomEnum::ANY.into())
            })?;
            let Some(value) = value else {
                debug!("Failed to read target {target}, skipping it.");
                continue;
            };

            let state = if value.is_missing() {
                trace!("The owner provided nothing for target {target}.");
                continue;
            } else if value.type_ == self.atoms.INCR {
                trace!("Target {target} will arrive incrementally.");
                TargetState::Incoming { data: Vec::new() }
            } else {
                TargetState::Ready(TargetBuffer::new(
                    target,
                    value.type_,
                    value.format,
                    value.data,
                ))
            };
            self.contents.push(SavedTarget { target, state });
        }

        if self.contents.is_empty() {
            return self.finish_save(request, false);
        }

        self.clipboard_time = time;
        self.transport
            .set_selection_owner(self.window, self.atoms.CLIPBOARD, time)?;
        if request.property != x11rb::NONE {
            self.trapped(|this| {
                this.transport.change_property(
                    PropMode::REPLACE,
                    request.requestor,
                    request.property,
                    this.atoms.ATOM,
                    32,
                    &encode32(&[this.atoms.NULL]),
                )
            })?;
        }

        if self.contents.iter().any(SavedTarget::is_incoming) {
            debug!("Waiting for incremental targets.");
            self.save = SaveState::ReceivingIncrementally(request);
            Ok(())
        } else {
            self.finish_save(request, true)
        }
    }

    fn receive_incrementally(&mut self, event: &PropertyNotifyEvent) -> Result<bool> {
        if event.window != self.window {
            return Ok(false);
        }
        let Some(index) = self
            .contents
            .iter()
            .position(|t| t.target == event.atom && t.is_incoming())
        else {
            return Ok(false);
        };

        let value = self.trapped(|this| {
            this.transport
                .get_property(true, this.window, event.atom, AtomEnum::ANY.into())
        })?;
        let Some(value) = value else {
            warn!("Lost incremental target {}.", event.atom);
            self.contents.remove(index);
            self.finish_incoming()?;
            return Ok(true);
        };
        if value.is_missing() {
            trace!("Property {} already consumed.", event.atom);
            return Ok(true);
        }

        let saved = &mut self.contents[index];
        if value.data.is_empty() {
            if let TargetState::Incoming { data } = &mut saved.state {
                let data = mem::take(data);
                debug!(
                    "Received {} bytes for target {} incrementally.",
                    data.len(),
                    saved.target
                );
                saved.state = TargetState::Ready(TargetBuffer::new(
                    saved.target,
                    value.type_,
                    value.format,
                    data,
                ));
            }
            self.finish_incoming()?;
        } else if let TargetState::Incoming { data } = &mut saved.state {
            trace!("Received {} bytes for target {}.", value.data.len(), event.atom);
            data.extend_from_slice(&value.data);
        }
        Ok(true)
    }

    /// Completes the save once no target is still arriving.
    fn finish_incoming(&mut self) -> Result<()> {
        let SaveState::ReceivingIncrementally(request) = &self.save else {
            return Ok(());
        };
        let request = *request;
        if self.contents.iter().any(SavedTarget::is_incoming) {
            return Ok(());
        }

        if self.contents.is_empty() {
            self.disown_clipboard()?;
            self.finish_save(request, false)
        } else {
            self.finish_save(request, true)
        }
    }

    fn send_incrementally(&mut self, event: &PropertyNotifyEvent) -> Result<bool> {
        let key = (event.window, event.atom);
        let Some(mut transfer) = self.conversions.remove(&key) else {
            return Ok(false);
        };

        let max_size = self.selection_max_size;
        match self.trapped(|this| transfer.send_chunk(&mut this.transport, max_size))? {
            Some(false) => {
                self.conversions.insert(key, transfer);
            }
            Some(true) => {
                debug!(
                    "Finished incremental transfer of target {} to {}.",
                    transfer.target, transfer.requestor
                );
                self.unwatch(transfer.requestor);
            }
            None => {
                debug!("Abandoning incremental transfer to {}.", transfer.requestor);
                self.unwatch(transfer.requestor);
            }
        }
        Ok(true)
    }

    fn convert_clipboard(&mut self, event: &SelectionRequestEvent) -> Result<()> {
        if self.contents.is_empty() {
            debug!("Refusing CLIPBOARD request: nothing saved.");
            return self.reply(event, x11rb::NONE);
        }

        let requestor = event.requestor;
        let multiple = event.target == self.atoms.MULTIPLE;
        let mut transfers = if multiple {
            let pairs = self.trapped(|this| {
                this.transport
                    .get_property(false, requestor, event.property, this.atoms.ATOM_PAIR)
            })?;
            let Some(pairs) = pairs
                .filter(|p| p.type_ == self.atoms.ATOM_PAIR)
                .and_then(|p| p.atoms())
            else {
                debug!("Invalid MULTIPLE request from {requestor}.");
                return self.reply(event, x11rb::NONE);
            };
            pairs
                .chunks_exact(2)
                .map(|pair| TransferState::begin(requestor, pair[0], pair[1]))
                .collect::<Vec<_>>()
        } else {
            vec![TransferState::begin(
                requestor,
                event.target,
                requested_property(event),
            )]
        };

        for transfer in &mut transfers {
            self.convert_clipboard_target(transfer)?;
        }

        if transfers.iter().all(|t| t.property == x11rb::NONE) {
            debug!("No requested target could be converted for {requestor}.");
            self.reply(event, x11rb::NONE)?;
            return Ok(());
        }

        let property = if multiple {
            let pairs = transfers
                .iter()
                .flat_map(|t| [t.target, t.property])
                .collect::<Vec<_>>();
            self.trapped(|this| {
                this.transport.change_property(
                    PropMode::REPLACE,
                    requestor,
                    event.property,
                    this.atoms.ATOM_PAIR,
                    32,
                    &encode32(&pairs),
                )
            })?;
            event.property
        } else {
            transfers[0].property
        };
        self.reply(event, property)?;

        for transfer in transfers {
            if !transfer.is_incremental() {
                continue;
            }
            if let Some(stale) = self
                .conversions
                .insert((transfer.requestor, transfer.property), transfer)
            {
                warn!(
                    "Replaced unfinished transfer of target {} to {}.",
                    stale.target, stale.requestor
                );
            }
        }
        Ok(())
    }

    fn convert_clipboard_target(&mut self, transfer: &mut TransferState) -> Result<()> {
        let (requestor, property) = (transfer.requestor, transfer.property);

        if transfer.target == self.atoms.TARGETS {
            let mut targets = Vec::with_capacity(self.contents.len() + 2);
            targets.extend([self.atoms.TARGETS, self.atoms.MULTIPLE]);
            targets.extend(self.targets());
            let written = self.trapped(|this| {
                this.transport.change_property(
                    PropMode::REPLACE,
                    requestor,
                    property,
                    this.atoms.ATOM,
                    32,
                    &encode32(&targets),
                )
            })?;
            if written.is_none() {
                transfer.property = x11rb::NONE;
            }
            return Ok(());
        }

        let buffer = match self
            .contents
            .iter()
            .find(|t| t.target == transfer.target)
            .map(|t| &t.state)
        {
            None => {
                trace!("Target {} is not saved.", transfer.target);
                transfer.property = x11rb::NONE;
                return Ok(());
            }
            Some(TargetState::Incoming { .. }) => {
                debug!("Target {} has not fully arrived yet.", transfer.target);
                transfer.property = x11rb::NONE;
                return Ok(());
            }
            Some(TargetState::Ready(buffer)) => Rc::clone(buffer),
        };

        let written = if buffer.len() <= self.selection_max_size {
            self.trapped(|this| {
                this.transport.change_property(
                    PropMode::REPLACE,
                    requestor,
                    property,
                    buffer.type_,
                    buffer.format,
                    buffer.data(),
                )
            })?
        } else {
            let items = u32::try_from(buffer.items()).unwrap_or(u32::MAX);
            let started = self.trapped(|this| {
                let mask = this.transport.event_mask(requestor)?;
                this.transport.select_input(
                    requestor,
                    mask | EventMask::PROPERTY_CHANGE | EventMask::STRUCTURE_NOTIFY,
                )?;
                this.transport.change_property(
                    PropMode::REPLACE,
                    requestor,
                    property,
                    this.atoms.INCR,
                    32,
                    &encode32(&[items]),
                )
            })?;
            if started.is_some() {
                debug!(
                    "Starting incremental transfer of {} bytes to {requestor}.",
                    buffer.len()
                );
                self.host.watch(
                    requestor,
                    true,
                    EventMask::PROPERTY_CHANGE | EventMask::STRUCTURE_NOTIFY,
                );
                transfer.start_incremental(buffer);
            }
            started
        };

        if written.is_none() {
            transfer.property = x11rb::NONE;
        }
        Ok(())
    }
}
