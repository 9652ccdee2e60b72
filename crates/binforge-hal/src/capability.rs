//! Capability interfaces of loaded engines.
//!
//! An engine exposes exactly one capability:
//!
//! | Capability | Trait | Reading |
//! |---|---|---|
//! | [`Capability::Scalar`] | [`ScalarSensor`] | [`Reading::Scalar`] |
//! | [`Capability::MultiChannel`] | [`MultiChannelSensor`] | [`Reading::Channels`] |
//!
//! Implementations report failures as [`InvokeError`] values; they never
//! unwind into the caller.

use std::collections::BTreeMap;

use binforge_types::{Capability, Reading};

use crate::error::InvokeError;

/// One read operation producing a single value (e.g. CPU load in percent).
pub trait ScalarSensor: Send {
    fn read_scalar(&mut self) -> Result<f64, InvokeError>;
}

/// One read operation producing labelled values (e.g. load per disk).
pub trait MultiChannelSensor: Send {
    fn read_channels(&mut self) -> Result<BTreeMap<String, f64>, InvokeError>;
}

pub enum EngineHandle {
    Scalar(Box<dyn ScalarSensor>),
    MultiChannel(Box<dyn MultiChannelSensor>),
}

/// A linked engine: its registry name plus its capability handle.
pub struct LoadedModule {
    name: String,
    handle: EngineHandle,
}

impl LoadedModule {
    pub fn new(name: impl Into<String>, handle: EngineHandle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn scalar(name: impl Into<String>, sensor: impl ScalarSensor + 'static) -> Self {
        Self::new(name, EngineHandle::Scalar(Box::new(sensor)))
    }

    pub fn multi_channel(name: impl Into<String>, sensor: impl MultiChannelSensor + 'static) -> Self {
        Self::new(name, EngineHandle::MultiChannel(Box::new(sensor)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> Capability {
        match self.handle {
            EngineHandle::Scalar(_) => Capability::Scalar,
            EngineHandle::MultiChannel(_) => Capability::MultiChannel,
        }
    }

    /// Dispatch to the one read operation this engine has.
    pub fn read(&mut self) -> Result<Reading, InvokeError> {
        match &mut self.handle {
            EngineHandle::Scalar(sensor) => sensor.read_scalar().map(Reading::Scalar),
            EngineHandle::MultiChannel(sensor) => sensor.read_channels().map(Reading::Channels),
        }
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("capability", &self.capability())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f64);
    impl ScalarSensor for Fixed {
        fn read_scalar(&mut self) -> Result<f64, InvokeError> {
            Ok(self.0)
        }
    }

    struct Disks;
    impl MultiChannelSensor for Disks {
        fn read_channels(&mut self) -> Result<BTreeMap<String, f64>, InvokeError> {
            Ok(BTreeMap::from([("sda".to_string(), 12.5), ("nvme0n1".to_string(), 3.0)]))
        }
    }

    #[test]
    fn dispatch_follows_capability() {
        let mut cpu = LoadedModule::scalar("cpu", Fixed(42.0));
        assert_eq!(cpu.capability(), Capability::Scalar);
        assert_eq!(cpu.read().unwrap(), Reading::Scalar(42.0));

        let mut disc = LoadedModule::multi_channel("disc", Disks);
        assert_eq!(disc.capability(), Capability::MultiChannel);
        match disc.read().unwrap() {
            Reading::Channels(map) => assert_eq!(map["sda"], 12.5),
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[test]
    fn debug_shows_name_and_capability() {
        let module = LoadedModule::scalar("ram", Fixed(1.0));
        let shown = format!("{module:?}");
        assert!(shown.contains("ram"));
        assert!(shown.contains("Scalar"));
    }
}
