use std::collections::BTreeSet;
use std::path::PathBuf;

/// Collects event paths between flushes.
///
/// Duplicates collapse, and a path is dropped on drain when one of its
/// descendants is also pending: invalidation fans out from the descendant to
/// every ancestor anyway.
#[derive(Debug, Default)]
pub(crate) struct Coalescer {
    pending: BTreeSet<PathBuf>,
}
impl Coalescer {
    pub fn push(&mut self, path: PathBuf) {
        self.pending.insert(path);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending path, in path order.
    pub fn drain(&mut self) -> Vec<PathBuf> {
        let pending: Vec<PathBuf> = std::mem::take(&mut self.pending).into_iter().collect();
        // Sorted order puts a path right before its descendants.
        let covered = |i: usize| pending.get(i + 1).is_some_and(|next| next.starts_with(&pending[i]));
        (0..pending.len()).filter(|&i| !covered(i)).map(|i| pending[i].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(coalescer: &mut Coalescer) -> Vec<String> {
        coalescer.drain().into_iter().map(|p| p.display().to_string()).collect()
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut coalescer = Coalescer::default();
        coalescer.push("/albums/x/a.jpg".into());
        coalescer.push("/albums/x/a.jpg".into());
        assert_eq!(paths(&mut coalescer), vec!["/albums/x/a.jpg"]);
        assert!(coalescer.is_empty());
    }

    #[test]
    fn test_ancestors_are_covered_by_descendants() {
        let mut coalescer = Coalescer::default();
        coalescer.push("/albums/x/y/b.jpg".into());
        coalescer.push("/albums/x".into());
        coalescer.push("/albums/x/a.jpg".into());
        coalescer.push("/albums/xy".into());
        coalescer.push("/albums".into());
        assert_eq!(paths(&mut coalescer), vec!["/albums/x/a.jpg", "/albums/x/y/b.jpg", "/albums/xy"]);
    }

    #[test]
    fn test_siblings_are_kept() {
        let mut coalescer = Coalescer::default();
        coalescer.push("/albums/b".into());
        coalescer.push("/albums/a".into());
        assert_eq!(paths(&mut coalescer), vec!["/albums/a", "/albums/b"]);
    }
}
