use core::ops::Range;
use std::mem;
use serde::{Deserialize, Serialize};
use crate::error::Error;
use crate::index_space::IndexSpace;




/**
 * Interface to a block's field data, as needed to pack a sub-region into a
 * contiguous byte buffer and unpack it on the other side of an exchange.
 * Values are laid out in row-major order over the region, with the selected
 * fields of each index stored together.
 */
pub trait FieldData {

    /// Return the number of fields (components) stored per index.
    fn num_fields(&self) -> usize;

    /// Return the size in bytes of a single field value.
    fn element_size(&self) -> usize;

    /// Append the values in `region`, for the given range of fields, to the
    /// end of `buffer`.
    fn copy_region_to_buffer(&self, region: &IndexSpace, fields: Range<usize>, buffer: &mut Vec<u8>) -> Result<(), Error>;

    /// Overwrite the values in `region`, for the given range of fields, from
    /// `buffer`. The buffer must hold exactly the number of bytes that
    /// `copy_region_to_buffer` would produce for the same arguments.
    fn copy_buffer_to_region(&mut self, region: &IndexSpace, fields: Range<usize>, buffer: &[u8]) -> Result<(), Error>;
}




/**
 * A patch is a mapping from a rectangular index space to associated field
 * values. The index space normally covers a block's valid region plus its
 * guard zones. Each index holds `num_fields` double-precision values, stored
 * contiguously in row-major order.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    space: IndexSpace,
    num_fields: usize,
    data: Vec<f64>,
}




impl Patch {


    /**
     * Generate a patch with all values set to zero.
     */
    pub fn zeros(space: IndexSpace, num_fields: usize) -> Self {
        Self {
            data: vec![0.0; space.len() * num_fields],
            space,
            num_fields,
        }
    }


    /**
     * Generate a patch with a single field, covering the given index space,
     * with values defined from a closure.
     */
    pub fn from_scalar_function<F>(space: IndexSpace, f: F) -> Self
    where
        F: Fn((i64, i64)) -> f64
    {
        Self {
            data: space.iter().map(f).collect(),
            space,
            num_fields: 1,
        }
    }


    /**
     * Generate a patch with `NUM_FIELDS` fields, covering the given index
     * space, with values defined from a closure.
     */
    pub fn from_vector_function<F, const NUM_FIELDS: usize>(space: IndexSpace, f: F) -> Self
    where
        F: Fn((i64, i64)) -> [f64; NUM_FIELDS]
    {
        Self {
            data: space.iter().flat_map(f).collect(),
            space,
            num_fields: NUM_FIELDS,
        }
    }


    /**
     * Return the index space covered by this patch.
     */
    pub fn index_space(&self) -> &IndexSpace {
        &self.space
    }


    /**
     * Return the raw field values.
     */
    pub fn data(&self) -> &[f64] {
        &self.data
    }


    /**
     * Return the field values at the given index.
     */
    pub fn get_slice(&self, index: (i64, i64)) -> &[f64] {
        self.validate_index(index);
        let s = self.space.row_major_offset(index) * self.num_fields;
        &self.data[s .. s + self.num_fields]
    }


    /**
     * Apply a function to every index in the given region, together with a
     * mutable reference to the field values there.
     */
    pub fn map_region_mut<F>(&mut self, region: &IndexSpace, mut f: F) -> Result<(), Error>
    where
        F: FnMut((i64, i64), &mut [f64])
    {
        self.validate_region(region)?;
        self.validate_layout()?;
        let selection = region.memory_region_in(&self.space);
        for (index, slice) in region.iter().zip(selection.iter_slice_mut(&mut self.data, self.num_fields)) {
            f(index, slice)
        }
        Ok(())
    }

    fn validate_index(&self, index: (i64, i64)) {
        if !self.space.contains(index) {
            panic!("index ({} {}) out of range on patch {}", index.0, index.1, self.space);
        }
    }

    fn validate_region(&self, region: &IndexSpace) -> Result<(), Error> {
        if self.space.contains_space(region) {
            Ok(())
        } else {
            Err(Error::RegionOutOfBounds { region: region.clone(), space: self.space.clone() })
        }
    }

    fn validate_layout(&self) -> Result<(), Error> {
        if self.num_fields == 0 {
            Err(Error::InvalidPartition(format!("patch {} has no fields", self.space)))
        } else {
            Ok(())
        }
    }

    fn validate_fields(&self, region: &IndexSpace, fields: &Range<usize>) -> Result<(), Error> {
        self.validate_region(region)?;
        self.validate_layout()?;

        if fields.start > fields.end || fields.end > self.num_fields {
            Err(Error::InvalidPartition(format!(
                "field range {}..{} exceeds the {} fields of patch {}",
                fields.start, fields.end, self.num_fields, self.space)))
        } else {
            Ok(())
        }
    }
}




// ============================================================================
impl FieldData for Patch {

    fn num_fields(&self) -> usize {
        self.num_fields
    }

    fn element_size(&self) -> usize {
        mem::size_of::<f64>()
    }

    fn copy_region_to_buffer(&self, region: &IndexSpace, fields: Range<usize>, buffer: &mut Vec<u8>) -> Result<(), Error> {
        self.validate_fields(region, &fields)?;

        let selection = region.memory_region_in(&self.space);
        buffer.reserve(region.len() * fields.len() * self.element_size());

        for slice in selection.iter_slice(&self.data, self.num_fields) {
            for x in &slice[fields.clone()] {
                buffer.extend_from_slice(&x.to_le_bytes())
            }
        }
        Ok(())
    }

    fn copy_buffer_to_region(&mut self, region: &IndexSpace, fields: Range<usize>, buffer: &[u8]) -> Result<(), Error> {
        self.validate_fields(region, &fields)?;

        let size = self.element_size();
        let expected = region.len() * fields.len() * size;

        if buffer.len() != expected {
            return Err(Error::Codec(format!(
                "buffer of {} bytes cannot fill region {} ({} bytes)",
                buffer.len(), region, expected)))
        }
        let selection = region.memory_region_in(&self.space);
        let mut values = buffer.chunks_exact(size);

        for slice in selection.iter_slice_mut(&mut self.data, self.num_fields) {
            for x in &mut slice[fields.clone()] {
                if let Some(bytes) = values.next() {
                    let mut raw = [0; 8];
                    raw.copy_from_slice(bytes);
                    *x = f64::from_le_bytes(raw)
                }
            }
        }
        Ok(())
    }
}
