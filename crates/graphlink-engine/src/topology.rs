//! Static graph description used by the reference engine.

use graphlink_core::{AddressingError, Endpoint, IncomingEdges, MulticastMessage};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Logic of a device simulated inside the engine.
pub trait DeviceBehaviour: Send + Sync {
    /// React to `data` arriving on `dst`; return the messages the device emits
    /// in response.
    fn receive(&mut self, dst: &Endpoint, data: Option<&Value>) -> Vec<MulticastMessage>;
}

/// Re-emits every payload on the device's `out` port.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl DeviceBehaviour for Echo {
    fn receive(&mut self, dst: &Endpoint, data: Option<&Value>) -> Vec<MulticastMessage> {
        match Endpoint::new(dst.device(), "out") {
            Ok(src) => vec![MulticastMessage {
                src,
                data: data.cloned(),
            }],
            Err(_) => Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("device '{0}' already exists")]
    DuplicateDevice(String),
    #[error("no device '{0}'")]
    UnknownDevice(String),
    #[error("device has no port {0}")]
    UnknownPort(Endpoint),
    #[error("{0} cannot be used in that direction")]
    WrongDirection(Endpoint),
    #[error(transparent)]
    Addressing(#[from] AddressingError),
}

/// Where a port sits relative to its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

pub struct Device {
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
    behaviour: Option<Box<dyn DeviceBehaviour>>,
}

impl Device {
    /// External devices are driven by a controller instead of a behaviour.
    pub fn is_external(&self) -> bool {
        self.behaviour.is_none()
    }

    pub fn direction(&self, port: &str) -> Option<Direction> {
        if self.outputs.contains(port) {
            Some(Direction::Output)
        } else if self.inputs.contains(port) {
            Some(Direction::Input)
        } else {
            None
        }
    }

    pub(crate) fn behaviour_mut(&mut self) -> Option<&mut (dyn DeviceBehaviour + 'static)> {
        self.behaviour.as_deref_mut()
    }
}

/// Devices, their ports, and the routes between them.
pub struct Topology {
    graph_type: String,
    graph_instance: String,
    devices: BTreeMap<String, Device>,
    routes: BTreeMap<Endpoint, Vec<Endpoint>>,
}

impl Topology {
    pub fn new(graph_type: impl Into<String>, graph_instance: impl Into<String>) -> Self {
        Self {
            graph_type: graph_type.into(),
            graph_instance: graph_instance.into(),
            devices: BTreeMap::new(),
            routes: BTreeMap::new(),
        }
    }

    /// `count` pairs of external `ext{i}` and echoing internal `int{i}`
    /// devices, wired `ext{i}:out → int{i}:in` and `int{i}:out → ext{i}:in`.
    pub fn echo(count: usize) -> Result<Self, TopologyError> {
        let mut topology = Self::new("echo", format!("echo_{count}"));
        for i in 0..count {
            let (int, ext) = (format!("int{i}"), format!("ext{i}"));
            topology.add_internal(&int, ["in"], ["out"], Echo)?;
            topology.add_external(&ext, ["in"], ["out"])?;
            topology.connect(&ext, "out", &int, "in")?;
            topology.connect(&int, "out", &ext, "in")?;
        }
        Ok(topology)
    }

    pub fn graph_type(&self) -> &str {
        &self.graph_type
    }

    pub fn graph_instance(&self) -> &str {
        &self.graph_instance
    }

    pub fn set_graph_instance(&mut self, graph_instance: impl Into<String>) {
        self.graph_instance = graph_instance.into();
    }

    pub fn add_external<I, O>(&mut self, id: &str, inputs: I, outputs: O) -> Result<(), TopologyError>
    where
        I: IntoIterator<Item: Into<String>>,
        O: IntoIterator<Item: Into<String>>,
    {
        self.add_device(id, inputs, outputs, None)
    }

    pub fn add_internal<I, O>(
        &mut self,
        id: &str,
        inputs: I,
        outputs: O,
        behaviour: impl DeviceBehaviour + 'static,
    ) -> Result<(), TopologyError>
    where
        I: IntoIterator<Item: Into<String>>,
        O: IntoIterator<Item: Into<String>>,
    {
        self.add_device(id, inputs, outputs, Some(Box::new(behaviour)))
    }

    fn add_device<I, O>(
        &mut self,
        id: &str,
        inputs: I,
        outputs: O,
        behaviour: Option<Box<dyn DeviceBehaviour>>,
    ) -> Result<(), TopologyError>
    where
        I: IntoIterator<Item: Into<String>>,
        O: IntoIterator<Item: Into<String>>,
    {
        if self.devices.contains_key(id) {
            return Err(TopologyError::DuplicateDevice(id.to_string()));
        }
        let device = Device {
            inputs: ports(id, inputs)?,
            outputs: ports(id, outputs)?,
            behaviour,
        };
        self.devices.insert(id.to_string(), device);
        Ok(())
    }

    /// Wire output `src_device:src_port` to input `dst_device:dst_port`.
    pub fn connect(
        &mut self,
        src_device: &str,
        src_port: &str,
        dst_device: &str,
        dst_port: &str,
    ) -> Result<(), TopologyError> {
        let src = Endpoint::new(src_device, src_port)?;
        let dst = Endpoint::new(dst_device, dst_port)?;
        self.check_port(&src, Direction::Output)?;
        self.check_port(&dst, Direction::Input)?;
        let dsts = self.routes.entry(src).or_default();
        if !dsts.contains(&dst) {
            dsts.push(dst);
        }
        Ok(())
    }

    /// Check that `ep` exists and is used in direction `want`.
    pub fn check_port(&self, ep: &Endpoint, want: Direction) -> Result<(), TopologyError> {
        let device = self
            .devices
            .get(ep.device())
            .ok_or_else(|| TopologyError::UnknownDevice(ep.device().to_string()))?;
        match device.direction(ep.port()) {
            None => Err(TopologyError::UnknownPort(ep.clone())),
            Some(dir) if dir != want => Err(TopologyError::WrongDirection(ep.clone())),
            Some(_) => Ok(()),
        }
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub(crate) fn device_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    pub fn externals(&self) -> impl Iterator<Item = &str> {
        self.devices
            .iter()
            .filter(|(_, d)| d.is_external())
            .map(|(id, _)| id.as_str())
    }

    /// Inputs wired to `src`, in wiring order.
    pub fn destinations(&self, src: &Endpoint) -> &[Endpoint] {
        self.routes.get(src).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every route that ends on one of `owned`.
    pub fn incoming_edges(&self, owned: &BTreeSet<String>) -> IncomingEdges {
        self.routes
            .iter()
            .flat_map(|(src, dsts)| dsts.iter().map(move |dst| (src, dst)))
            .filter(|(_, dst)| owned.contains(dst.device()))
            .map(|(src, dst)| (src.clone(), dst.clone()))
            .collect()
    }
}

fn ports<P>(device: &str, names: P) -> Result<BTreeSet<String>, TopologyError>
where
    P: IntoIterator<Item: Into<String>>,
{
    names
        .into_iter()
        .map(|port| -> Result<String, TopologyError> {
            let port = port.into();
            Endpoint::new(device, &port)?;
            Ok(port)
        })
        .collect()
}
