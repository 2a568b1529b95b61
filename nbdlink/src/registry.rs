//! Fixed table of device slots addressed by unit number.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::config::Config;
use crate::error::RegistryError;
use crate::session::{Session, SessionState};
use crate::types::DeviceGeometry;

/// Number of slots a registry has unless configured otherwise.
pub const DEFAULT_DEVICE_COUNT: usize = 16;

struct DeviceSlot<S> {
    geometry: DeviceGeometry,
    session: Option<Arc<Session<S>>>,
}

impl<S> DeviceSlot<S> {
    /// A slot is busy while it holds a session that has not terminated,
    /// including one still being attached.
    fn is_busy(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.is_terminated())
    }
}

/// Device slots, each with a geometry and at most one live session.
pub struct DeviceRegistry<S> {
    slots: Vec<Mutex<DeviceSlot<S>>>,
    read_timeout: Option<Duration>,
}

impl<S> Default for DeviceRegistry<S> {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_COUNT)
    }
}

impl<S> DeviceRegistry<S> {
    pub fn new(count: usize) -> Self {
        Self::with_geometry(count, DeviceGeometry::default())
    }

    pub fn with_geometry(count: usize, geometry: DeviceGeometry) -> Self {
        let slots = (0..count)
            .map(|_| {
                Mutex::new(DeviceSlot {
                    geometry,
                    session: None,
                })
            })
            .collect();
        Self {
            slots,
            read_timeout: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_geometry(config.registry.devices, config.device.geometry())
            .with_read_timeout(config.peer.read_timeout())
    }

    /// Reply read deadline for sessions attached from now on.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, unit: usize) -> Result<&Mutex<DeviceSlot<S>>, RegistryError> {
        self.slots.get(unit).ok_or(RegistryError::NoSuchDevice {
            unit,
            count: self.slots.len(),
        })
    }

    /// The session most recently attached to `unit`, if any. It may have
    /// terminated since.
    pub fn session(&self, unit: usize) -> Result<Option<Arc<Session<S>>>, RegistryError> {
        Ok(self.slot(unit)?.lock().session.clone())
    }

    pub fn geometry(&self, unit: usize) -> Result<DeviceGeometry, RegistryError> {
        Ok(self.slot(unit)?.lock().geometry)
    }

    pub fn block_count(&self, unit: usize) -> Result<u64, RegistryError> {
        Ok(self.geometry(unit)?.block_count())
    }

    /// Change the block size of `unit`. Applies to the live session, if
    /// any, and to every session attached afterwards.
    pub fn set_block_size(&self, unit: usize, block_size: u32) -> Result<(), RegistryError> {
        let mut slot = self.slot(unit)?.lock();
        let geometry = DeviceGeometry {
            block_size,
            ..slot.geometry
        };
        geometry.validate()?;
        if let Some(session) = &slot.session {
            if !session.is_terminated() {
                session.set_block_size(block_size)?;
            }
        }
        slot.geometry = geometry;
        info!(unit, block_size, "block size set");
        Ok(())
    }
}

impl<S> DeviceRegistry<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Bind `stream` to `unit` under a new session using the slot's
    /// geometry.
    ///
    /// The caller drives the returned session's [`run`](Session::run) loop.
    pub async fn attach(
        &self,
        unit: usize,
        stream: S,
    ) -> Result<Arc<Session<S>>, RegistryError> {
        let session = Arc::new(Session::new().with_read_timeout(self.read_timeout));
        let geometry = {
            let mut slot = self.slot(unit)?.lock();
            if slot.is_busy() {
                return Err(RegistryError::Busy { unit });
            }
            // Reserve the slot; an idle session already counts as busy.
            slot.session = Some(Arc::clone(&session));
            slot.geometry
        };

        if let Err(e) = session.attach(stream, geometry).await {
            let mut slot = self.slot(unit)?.lock();
            if slot
                .session
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, &session))
            {
                slot.session = None;
            }
            return Err(e.into());
        }

        info!(
            unit,
            block_size = geometry.block_size,
            blocks = geometry.block_count(),
            "device attached"
        );
        Ok(session)
    }

    /// Terminate the session on `unit` and free the slot.
    pub async fn detach(&self, unit: usize) -> Result<(), RegistryError> {
        let session = {
            let mut slot = self.slot(unit)?.lock();
            match slot.session.take() {
                Some(session) if session.state() == SessionState::Idle => {
                    slot.session = Some(session);
                    return Err(RegistryError::Busy { unit });
                }
                Some(session) => session,
                None => return Err(RegistryError::NotAttached { unit }),
            }
        };
        session.detach().await?;
        info!(unit, "device detached");
        Ok(())
    }
}
