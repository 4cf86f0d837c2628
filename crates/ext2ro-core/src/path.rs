use crate::Volume;
use ext2ro_error::{Ext2Error, Result};
use ext2ro_ondisk::Ext2Inode;
use ext2ro_types::InodeNumber;

impl Volume {
    /// Resolve an absolute path to its inode.
    ///
    /// Walks from the root (inode 2) one component at a time. Empty
    /// components from repeated or trailing `/` are ignored, so `"/"` is the
    /// root itself. Symbolic links are returned as found, never followed.
    ///
    /// A relative path, a missing component or a component looked up inside
    /// a non-directory all fail with `NotFound(path)`.
    pub fn resolve_path(&self, path: &str) -> Result<(InodeNumber, Ext2Inode)> {
        if !path.starts_with('/') {
            return Err(Ext2Error::NotFound(path.to_owned()));
        }

        let mut current_ino = InodeNumber::ROOT;
        let mut current = self.read_inode(current_ino)?;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entry = self
                .find_named_entry(&current, component.as_bytes())
                .map_err(|e| match e {
                    Ext2Error::NotFound(_) => Ext2Error::NotFound(path.to_owned()),
                    other => other,
                })?;
            current_ino = entry.inode;
            current = self.read_inode(current_ino)?;
        }

        Ok((current_ino, current))
    }
}
