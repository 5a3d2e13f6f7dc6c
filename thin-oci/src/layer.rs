use crate::manifest::Descriptor;

/// A layer payload fetched in full from the registry.
///
/// Workers only produce these; writing to disk is left to whoever
/// consumes them.
#[derive(Debug, Clone)]
pub struct FetchedLayer {
    pub descriptor: Descriptor,
    pub data: Vec<u8>,
}

impl FetchedLayer {
    pub fn digest(&self) -> &str {
        &self.descriptor.digest
    }
}
