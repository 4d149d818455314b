//! Stop-sequence detection over accumulated output bytes

/// A stop marker found in the output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMatch {
    /// Index of the marker in the configured list
    pub marker: usize,
    /// Byte offset of its first occurrence
    pub offset: usize,
}

/// Ordered set of literal stop markers.
///
/// Markers are checked in list order and the first one present anywhere in
/// the text wins, even if a later marker occurs earlier in the text.
#[derive(Debug, Clone, Default)]
pub struct StopMarkers {
    markers: Vec<String>,
}

impl StopMarkers {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Finds the first marker (in list order) present in `output`.
    pub fn find(&self, output: &[u8]) -> Option<StopMatch> {
        self.markers.iter().enumerate().find_map(|(marker, m)| {
            find_bytes(output, m.as_bytes()).map(|offset| StopMatch { marker, offset })
        })
    }

    /// Cuts `output` just before the first matching marker.
    ///
    /// Returns the match, or `None` and leaves `output` untouched.
    pub fn truncate(&self, output: &mut Vec<u8>) -> Option<StopMatch> {
        let hit = self.find(output)?;
        output.truncate(hit.offset);
        Some(hit)
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_before_marker() {
        let stops = StopMarkers::new(["User:"]);
        let mut output = b"Hello there\nUser: what".to_vec();

        let hit = stops.truncate(&mut output).unwrap();
        assert_eq!(hit, StopMatch { marker: 0, offset: 12 });
        assert_eq!(output, b"Hello there\n");
    }

    #[test]
    fn test_list_order_beats_position() {
        let stops = StopMarkers::new(["###", "User:"]);
        let output = b"User: hi ### bye";

        let hit = stops.find(output).unwrap();
        assert_eq!(hit.marker, 0);
        assert_eq!(hit.offset, 9);
    }

    #[test]
    fn test_earliest_occurrence_of_winning_marker() {
        let stops = StopMarkers::new(["ab"]);
        assert_eq!(stops.find(b"xxabyyab").unwrap().offset, 2);
    }

    #[test]
    fn test_no_match_leaves_output() {
        let stops = StopMarkers::new(["User:", "###"]);
        let mut output = b"nothing to see".to_vec();
        assert!(stops.truncate(&mut output).is_none());
        assert_eq!(output, b"nothing to see");
    }

    #[test]
    fn test_marker_spanning_tokens() {
        let stops = StopMarkers::new(["<|start_header_id|>"]);
        let mut output = b"done<|start_".to_vec();
        assert!(stops.find(&output).is_none());
        output.extend_from_slice(b"header_id|>");
        assert_eq!(stops.find(&output).unwrap().offset, 4);
    }

    #[test]
    fn test_matches_next_to_partial_utf8() {
        let stops = StopMarkers::new(["###"]);
        let output = [0xEC, 0x95, b'#', b'#', b'#'];
        assert_eq!(stops.find(&output).unwrap().offset, 2);
    }

    #[test]
    fn test_empty_markers_ignored() {
        let stops = StopMarkers::new(["", "x"]);
        assert_eq!(stops.markers().len(), 1);
        assert!(StopMarkers::new(Vec::<String>::new()).is_empty());
    }
}
