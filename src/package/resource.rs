//! Handoff point between the container and type-specific resource decoders.
//!
//! The container only deals in resource type ids and byte buffers. Which type
//! id maps to which decoder is decided by a [`ResourceRegistry`] the embedding
//! application builds once and passes to wherever decoding happens.

use anyhow::{anyhow, Context, Result};
use binrw::{binrw, BinRead, BinWrite};
use std::any::Any;
use std::collections::HashMap;
use std::io::Cursor;

pub const NAME_MAP_TYPE: u32 = 0x0166038C;

pub trait Resource: std::fmt::Debug + Any {
    fn from_bytes(data: &[u8]) -> Result<Self> where Self: Sized;
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

impl dyn Resource {
    pub fn downcast_ref<T: Resource>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

/// A wrapper for unknown or generic resources
#[derive(Debug)]
pub struct GenericResource {
    pub data: Vec<u8>,
}

impl Resource for GenericResource {
    fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self { data: data.to_vec() })
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }
}

/// NameMap resource (0x0166038C): instance id to display name
#[binrw]
#[derive(Debug, Default)]
#[br(little)]
#[bw(little)]
pub struct NameMapResource {
    pub version: u32,
    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    count: u32,
    #[br(count = count)]
    pub entries: Vec<NameMapEntry>,
}

#[binrw]
#[derive(Debug, Clone)]
#[br(little)]
#[bw(little)]
pub struct NameMapEntry {
    pub instance: u64,
    #[br(temp)]
    #[bw(calc = name.len() as u32)]
    name_len: u32,
    #[br(count = name_len, map = |s: Vec<u8>| String::from_utf8_lossy(&s).into_owned())]
    #[bw(map = |s: &String| s.as_bytes().to_vec())]
    pub name: String,
}

impl NameMapResource {
    pub fn name_of(&self, instance: u64) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.instance == instance)
            .map(|e| e.name.as_str())
    }
}

impl Resource for NameMapResource {
    fn from_bytes(data: &[u8]) -> Result<Self> {
        // Each entry needs at least an instance and a length word.
        if data.len() >= 8 {
            let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
            if count.saturating_mul(12) > data.len() - 8 {
                return Err(anyhow!("Invalid NameMap header: count too large for data size"));
            }
        }
        let mut cursor = Cursor::new(data);
        Self::read(&mut cursor).context("Failed to read NameMapResource")
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut cursor = Cursor::new(&mut data);
        self.write(&mut cursor).context("Failed to write NameMapResource")?;
        Ok(data)
    }
}

pub type Decoder = fn(&[u8]) -> Result<Box<dyn Resource>>;

fn decode_as<R: Resource>(data: &[u8]) -> Result<Box<dyn Resource>> {
    Ok(Box::new(R::from_bytes(data)?))
}

/// Maps resource type ids to decoders. Unregistered types decode as
/// [`GenericResource`].
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    decoders: HashMap<u32, Decoder>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the decoders this crate ships.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<NameMapResource>(NAME_MAP_TYPE);
        registry
    }

    pub fn register<R: Resource>(&mut self, res_type: u32) -> &mut Self {
        self.decoders.insert(res_type, decode_as::<R>);
        self
    }

    pub fn register_fn(&mut self, res_type: u32, decoder: Decoder) -> &mut Self {
        self.decoders.insert(res_type, decoder);
        self
    }

    pub fn is_registered(&self, res_type: u32) -> bool {
        self.decoders.contains_key(&res_type)
    }

    pub fn decode(&self, res_type: u32, data: &[u8]) -> Result<Box<dyn Resource>> {
        match self.decoders.get(&res_type) {
            Some(decoder) => decoder(data)
                .with_context(|| format!("Failed to decode resource type 0x{res_type:08X}")),
            None => decode_as::<GenericResource>(data),
        }
    }
}
