//! Request-selected views of a value
//!
//! A request names the top-level fields an operation works on, for example
//!
//! ```text
//! structure
//!     structure putField
//!         structure value
//!     structure getField
//!         structure value
//!         structure alarm
//! ```
//!
//! A [`PvCopy`] is the reduced shape of one side together with the mapping
//! between its offsets and the offsets of the full value.

use std::sync::Arc;

use super::{BitSet, Field, PvDataError, PvDataResult, PvStructure, Structure};

/// Request section that applies to both sides when a side has none of its own
pub const FIELD_SECTION: &str = "field";

/// Type id of a reduced view
pub const VIEW_TYPE_ID: &str = "structure";

/// Mapping between a full structure and a selection of its top-level fields
#[derive(Debug, Clone)]
pub struct PvCopy {
    master: Arc<Structure>,
    view: Arc<Structure>,
    /// Master field index of each view field
    indices: Vec<usize>,
}

impl PvCopy {
    /// View of every field
    pub fn full(master: &Arc<Structure>) -> Self {
        Self {
            master: master.clone(),
            view: master.clone(),
            indices: (0..master.fields().len()).collect(),
        }
    }

    /// View of the named top-level fields, in master order; empty selects everything
    pub fn select(master: &Arc<Structure>, names: &[&str]) -> PvDataResult<Self> {
        if names.is_empty() {
            return Ok(Self::full(master));
        }
        if let Some(missing) = names.iter().find(|n| master.index_of(n).is_none()) {
            return Err(PvDataError::NoSuchField(missing.to_string()));
        }
        let indices: Vec<usize> = (0..master.fields().len())
            .filter(|&i| names.contains(&master.fields()[i].0.as_str()))
            .collect();
        if indices.len() == master.fields().len() {
            return Ok(Self::full(master));
        }
        let fields = indices
            .iter()
            .map(|&i| master.fields()[i].clone())
            .collect();
        Ok(Self {
            master: master.clone(),
            view: Arc::new(Structure::new(VIEW_TYPE_ID, fields)),
            indices,
        })
    }

    /// View named by `section` of a request, or by its `field` section
    pub fn from_request(
        master: &Arc<Structure>,
        request: &PvStructure,
        section: &str,
    ) -> PvDataResult<Self> {
        let selection = [section, FIELD_SECTION]
            .iter()
            .find_map(|name| match request.structure().field(name) {
                Some(Field::Structure(s)) => Some(s.clone()),
                _ => None,
            });
        match selection {
            Some(selection) => {
                let names: Vec<&str> = selection.fields().iter().map(|(n, _)| n.as_str()).collect();
                Self::select(master, &names)
            }
            None => Ok(Self::full(master)),
        }
    }

    pub fn structure(&self) -> &Arc<Structure> {
        &self.view
    }

    pub fn is_full(&self) -> bool {
        Arc::ptr_eq(&self.master, &self.view)
    }

    /// The selected fields of `master` as a value of the view's shape
    pub fn view_of(&self, master: &PvStructure) -> PvStructure {
        if self.is_full() {
            return master.clone();
        }
        let mut view = PvStructure::new(self.view.clone());
        for (slot, &index) in view.fields_mut().iter_mut().zip(&self.indices) {
            slot.clone_from(&master.fields()[index]);
        }
        view
    }

    /// Full-shape value and mask carrying the changed fields of a view value
    pub fn expand(&self, view: &PvStructure, changed: &BitSet) -> PvDataResult<(PvStructure, BitSet)> {
        if view.structure() != &self.view {
            return Err(PvDataError::StructureMismatch {
                expected: self.view.id().to_string(),
                found: view.structure().id().to_string(),
            });
        }
        if self.is_full() {
            return Ok((view.clone(), changed.clone()));
        }

        let mut master = PvStructure::new(self.master.clone());
        let mut mask = BitSet::new();
        let whole = changed.get(0);
        let mut view_offset = 1;
        for (i, &index) in self.indices.iter().enumerate() {
            let count = self.view.fields()[i].1.field_count();
            let master_offset = child_offset(&self.master, index);
            if whole {
                mask.set(master_offset);
            } else {
                for bit in (view_offset..view_offset + count).filter(|&b| changed.get(b)) {
                    mask.set(master_offset + bit - view_offset);
                }
            }
            master.fields_mut()[index] = view.fields()[i].clone();
            view_offset += count;
        }
        Ok((master, mask))
    }
}

/// Pre-order offset of the `index`th top-level field
fn child_offset(structure: &Structure, index: usize) -> usize {
    1 + structure.fields()[..index]
        .iter()
        .map(|(_, f)| f.field_count())
        .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::{ScalarType, ScalarValue};

    fn record() -> PvStructure {
        let mut value = PvStructure::new(Structure::nt_scalar(ScalarType::Double));
        value.set("value", ScalarValue::Double(4.0)).unwrap();
        value.set("alarm.severity", ScalarValue::Int(1)).unwrap();
        value
    }

    /// Request with one section per entry; names are comma separated
    fn request(sections: &[(&str, &str)]) -> PvStructure {
        let mut builder = Structure::builder("");
        for (section, names) in sections {
            let mut selection = Structure::builder("");
            for name in names.split(',') {
                selection = selection.structure(name, Structure::builder("").build());
            }
            builder = builder.structure(*section, selection.build());
        }
        PvStructure::new(builder.build())
    }

    #[test]
    fn test_empty_request_selects_everything() {
        let record = record();
        let copy = PvCopy::from_request(record.structure(), &request(&[]), "getField").unwrap();
        assert!(copy.is_full());
        assert_eq!(copy.view_of(&record), record);
    }

    #[test]
    fn test_reduced_view() {
        let record = record();
        let copy =
            PvCopy::from_request(record.structure(), &request(&[("getField", "alarm,value")]), "getField")
                .unwrap();
        let names: Vec<&str> = copy.structure().fields().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["value", "alarm"]);
        assert_eq!(copy.structure().id(), VIEW_TYPE_ID);

        let view = copy.view_of(&record);
        assert_eq!(view.scalar("value"), Some(&ScalarValue::Double(4.0)));
        assert_eq!(view.scalar("alarm.severity"), Some(&ScalarValue::Int(1)));
        assert!(view.get("timeStamp").is_none());
    }

    #[test]
    fn test_field_section_is_the_fallback() {
        let record = record();
        let req = request(&[("field", "timeStamp"), ("putField", "value")]);
        let put = PvCopy::from_request(record.structure(), &req, "putField").unwrap();
        let get = PvCopy::from_request(record.structure(), &req, "getField").unwrap();
        assert_eq!(put.structure().fields()[0].0, "value");
        assert_eq!(get.structure().fields().len(), 1);
        assert_eq!(get.structure().fields()[0].0, "timeStamp");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let record = record();
        let req = request(&[("field", "value,display")]);
        assert_eq!(
            PvCopy::from_request(record.structure(), &req, "getField").unwrap_err(),
            PvDataError::NoSuchField("display".to_string())
        );
    }

    #[test]
    fn test_expand_translates_offsets() {
        let master = record();
        let copy = PvCopy::select(master.structure(), &["timeStamp"]).unwrap();
        let mut view = PvStructure::new(copy.structure().clone());
        // view: root 0, timeStamp 1, secondsPastEpoch 2, nanoseconds 3, userTag 4
        let offset = view.set("timeStamp.userTag", ScalarValue::Int(12)).unwrap();
        assert_eq!(offset, 4);

        let (update, mask) = copy.expand(&view, &BitSet::from_iter([offset])).unwrap();
        assert_eq!(mask, BitSet::from_iter([9]));

        let mut target = master.clone();
        target.copy_masked_from(&update, &mask).unwrap();
        assert_eq!(target.scalar("timeStamp.userTag"), Some(&ScalarValue::Int(12)));
        assert_eq!(target.scalar("value"), Some(&ScalarValue::Double(4.0)));
    }

    #[test]
    fn test_expand_whole_view() {
        let master = record();
        let copy = PvCopy::select(master.structure(), &["value"]).unwrap();
        let mut view = copy.view_of(&master);
        view.set("value", ScalarValue::Double(-1.0)).unwrap();

        let (update, mask) = copy.expand(&view, &BitSet::from_iter([0])).unwrap();
        assert_eq!(mask, BitSet::from_iter([1]));
        assert_eq!(update.scalar("value"), Some(&ScalarValue::Double(-1.0)));
    }
}
