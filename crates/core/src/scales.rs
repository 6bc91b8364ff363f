//! Scale-dataset discovery

use crate::error::{PyramidError, PyramidResult};
use crate::reader::DatasetReader;

/// Parse the level number of a child named `s<N>`
pub fn scale_level(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('s')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Children of `group` named `s<N>`, finest first
///
/// Sorting is numeric, so `s10` comes after `s2`. Children with other names
/// are ignored.
pub fn list_and_sort_scale_datasets(
    reader: &dyn DatasetReader,
    group: &str,
) -> PyramidResult<Vec<String>> {
    let mut scales: Vec<(u32, String)> = reader
        .list(group)?
        .into_iter()
        .filter_map(|name| scale_level(&name).map(|level| (level, name)))
        .collect();

    if scales.is_empty() {
        return Err(PyramidError::NoScaleDatasets(group.to_string()));
    }

    scales.sort();
    Ok(scales.into_iter().map(|(_, name)| name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{DatasetAttributes, InMemoryReader};

    #[test]
    fn test_scale_level() {
        assert_eq!(scale_level("s0"), Some(0));
        assert_eq!(scale_level("s12"), Some(12));
        assert_eq!(scale_level("s"), None);
        assert_eq!(scale_level("s1a"), None);
        assert_eq!(scale_level("s-1"), None);
        assert_eq!(scale_level("raw"), None);
        assert_eq!(scale_level("S1"), None);
    }

    #[test]
    fn test_numeric_sort_ignores_other_children() {
        let reader = InMemoryReader::new();
        let attrs = DatasetAttributes::label_multiset(vec![8, 8, 8], vec![4, 4, 4]);
        for name in ["s10", "s2", "s0", "s1", "labels", "s3x"] {
            reader.create_dataset(&format!("seg/{}", name), &attrs);
        }

        let scales = list_and_sort_scale_datasets(&reader, "seg").unwrap();
        assert_eq!(scales, vec!["s0", "s1", "s2", "s10"]);
    }

    #[test]
    fn test_no_scales() {
        let reader = InMemoryReader::new();
        reader.create_group("seg/labels");

        let err = list_and_sort_scale_datasets(&reader, "seg").unwrap_err();
        assert!(matches!(err, PyramidError::NoScaleDatasets(group) if group == "seg"));

        let err = list_and_sort_scale_datasets(&reader, "absent").unwrap_err();
        assert!(matches!(err, PyramidError::Reader(_)));
    }
}
