//! A typed convenience layer over a [`PropertyAdapter`].
//!
//! The adapter moves raw bytes; [`PropertyClient`] adds the common access
//! patterns management tooling needs: single-element get/set, the
//! current-element count, and walking an interface object's property
//! descriptions.

use std::sync::Arc;

use crate::error::Error;
use crate::property::{parse_current_elements, Description, PropertyAdapter};

/// Upper bound when walking property descriptions; a property index is
/// one byte.
const MAX_PROPERTY_INDEX: u16 = 256;

/// Typed property access over any back-end.
pub struct PropertyClient {
    adapter: Arc<dyn PropertyAdapter>,
}

impl PropertyClient {
    pub fn new(adapter: Arc<dyn PropertyAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn PropertyAdapter> {
        &self.adapter
    }

    pub fn is_open(&self) -> bool {
        self.adapter.is_open()
    }

    pub async fn close(&self) {
        self.adapter.close().await;
    }

    /// Reads the first element of a property.
    pub async fn get(&self, object_index: u8, property_id: u8) -> Result<Vec<u8>, Error> {
        self.adapter.get_property(object_index, property_id, 1, 1).await
    }

    /// Reads a range of elements.
    pub async fn get_range(
        &self,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
    ) -> Result<Vec<u8>, Error> {
        self.adapter
            .get_property(object_index, property_id, start, elements)
            .await
    }

    /// Writes the first element of a property.
    pub async fn set(
        &self,
        object_index: u8,
        property_id: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        self.adapter
            .set_property(object_index, property_id, 1, 1, data)
            .await
    }

    /// Writes a range of elements.
    pub async fn set_range(
        &self,
        object_index: u8,
        property_id: u8,
        start: u16,
        elements: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        self.adapter
            .set_property(object_index, property_id, start, elements, data)
            .await
    }

    /// Reads how many elements a property currently holds, stored as a
    /// 2- or 4-byte count in element 0.
    pub async fn current_elements(
        &self,
        object_index: u8,
        property_id: u8,
    ) -> Result<u32, Error> {
        let data = self
            .adapter
            .get_property(object_index, property_id, 0, 1)
            .await?;
        parse_current_elements(&data)
    }

    /// Reads one property description by PID.
    pub async fn describe(
        &self,
        object_index: u8,
        property_id: u8,
    ) -> Result<Description, Error> {
        self.adapter
            .get_description(object_index, property_id, 0)
            .await
    }

    /// Walks the descriptions of an interface object by property index
    /// until the device stops answering. A device refusing an index or
    /// staying silent ends the walk; transport-level failures propagate.
    pub async fn scan(&self, object_index: u8) -> Result<Vec<Description>, Error> {
        let mut descriptions = Vec::new();
        for index in 0..MAX_PROPERTY_INDEX {
            match self
                .adapter
                .get_description(object_index, 0, index as u8)
                .await
            {
                Ok(description) => descriptions.push(description),
                Err(Error::Remote(_)) | Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(descriptions)
    }
}

impl std::fmt::Debug for PropertyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyClient")
            .field("adapter", &self.adapter.name())
            .finish()
    }
}
