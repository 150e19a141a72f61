//! Shortcut library: read/modify/write the shortcut database in place via
//! the VDF codec, and install artwork for entries.

use std::path::{Path, PathBuf};

use dock_core::protocol::ShortcutInfo;
use dock_core::vdf::{self, Shortcut};

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("shortcut database I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shortcut database parse error: {0}")]
    Vdf(#[from] vdf::VdfError),
    #[error("no shortcut with app id {0}")]
    NotFound(u32),
}

/// Owns the database path and the artwork directory. Mutating operations
/// are serialized by the caller (one Agent process owns its own files).
pub struct ShortcutLibrary {
    db_path: PathBuf,
    artwork_dir: PathBuf,
}

impl ShortcutLibrary {
    pub fn new(db_path: impl Into<PathBuf>, artwork_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            artwork_dir: artwork_dir.into(),
        }
    }

    /// List entries. An unreadable or malformed database yields an empty
    /// list plus a warning, not a failure; a missing database is just empty.
    pub fn list(&self) -> (Vec<ShortcutInfo>, Option<String>) {
        if !self.db_path.exists() {
            return (vec![], None);
        }
        let bytes = match std::fs::read(&self.db_path) {
            Ok(b) => b,
            Err(e) => return (vec![], Some(format!("unreadable shortcut database: {e}"))),
        };
        match vdf::parse_shortcuts(&bytes) {
            Ok(entries) => (
                entries
                    .iter()
                    .map(|s| ShortcutInfo {
                        app_id: s.app_id,
                        name: s.app_name.clone(),
                        exe: s.exe.clone(),
                        start_dir: s.start_dir.clone(),
                    })
                    .collect(),
                None,
            ),
            Err(e) => (vec![], Some(format!("malformed shortcut database: {e}"))),
        }
    }

    /// Create or update a shortcut. The app id is derived from (exe, name),
    /// so re-creating with identical inputs updates the existing entry
    /// instead of duplicating it. Write-path errors are fatal.
    pub fn create(
        &self,
        name: &str,
        exe: &str,
        start_dir: &str,
        launch_options: &str,
        tags: &[String],
    ) -> Result<u32, LibraryError> {
        let mut entries = self.load_for_write()?;
        let app_id = vdf::derive_app_id(exe, name);
        let shortcut = Shortcut {
            app_id,
            app_name: name.to_string(),
            exe: exe.to_string(),
            start_dir: start_dir.to_string(),
            launch_options: launch_options.to_string(),
            last_play_time: 0,
            tags: tags.to_vec(),
            extra: vec![],
        };
        match entries.iter_mut().find(|s| s.app_id == app_id) {
            Some(existing) => {
                // Keep foreign fields and play time from the old entry.
                let extra = std::mem::take(&mut existing.extra);
                let last_play_time = existing.last_play_time;
                *existing = Shortcut {
                    extra,
                    last_play_time,
                    ..shortcut
                };
            }
            None => entries.push(shortcut),
        }
        self.store(&entries)?;
        Ok(app_id)
    }

    /// Delete by app id. Parse failures are fatal here: a write against a
    /// database we could not read would drop every other entry.
    pub fn delete(&self, app_id: u32) -> Result<(), LibraryError> {
        let mut entries = self.load_for_write()?;
        let before = entries.len();
        entries.retain(|s| s.app_id != app_id);
        if entries.len() == before {
            return Err(LibraryError::NotFound(app_id));
        }
        self.store(&entries)
    }

    /// Install a transferred image as artwork: `{app_id}_{slot}.{ext}` under
    /// the artwork directory.
    pub fn apply_artwork(
        &self,
        app_id: u32,
        slot: &str,
        source: &Path,
    ) -> Result<PathBuf, LibraryError> {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png");
        let dest = self.artwork_dir.join(format!("{app_id}_{slot}.{ext}"));
        std::fs::create_dir_all(&self.artwork_dir).map_err(|e| LibraryError::Io {
            path: self.artwork_dir.clone(),
            source: e,
        })?;
        std::fs::copy(source, &dest).map_err(|e| LibraryError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        Ok(dest)
    }

    fn load_for_write(&self) -> Result<Vec<Shortcut>, LibraryError> {
        if !self.db_path.exists() {
            return Ok(vec![]);
        }
        let bytes = std::fs::read(&self.db_path).map_err(|e| LibraryError::Io {
            path: self.db_path.clone(),
            source: e,
        })?;
        Ok(vdf::parse_shortcuts(&bytes)?)
    }

    fn store(&self, entries: &[Shortcut]) -> Result<(), LibraryError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LibraryError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&self.db_path, vdf::write_shortcuts(entries)).map_err(|e| {
            LibraryError::Io {
                path: self.db_path.clone(),
                source: e,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lib_in(dir: &Path) -> ShortcutLibrary {
        ShortcutLibrary::new(dir.join("shortcuts.vdf"), dir.join("grid"))
    }

    #[test]
    fn missing_database_lists_empty_without_warning() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        let (entries, warning) = lib.list();
        assert!(entries.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn create_then_list_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        let id = lib
            .create("Hades", "/games/hades/run", "/games/hades", "", &["Roguelike".into()])
            .unwrap();
        let (entries, warning) = lib.list();
        assert!(warning.is_none());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].app_id, id);
        assert_eq!(entries[0].name, "Hades");
    }

    #[test]
    fn recreate_same_inputs_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        let a = lib.create("Hades", "/games/hades/run", "/games/hades", "", &[]).unwrap();
        let b = lib.create("Hades", "/games/hades/run", "/games/hades", "-v", &[]).unwrap();
        assert_eq!(a, b);
        assert_eq!(lib.list().0.len(), 1);
    }

    #[test]
    fn delete_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        assert!(matches!(lib.delete(42), Err(LibraryError::NotFound(42))));
    }

    #[test]
    fn corrupt_database_warns_on_list_but_fails_writes() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        std::fs::write(dir.path().join("shortcuts.vdf"), b"\x00oops").unwrap();
        let (entries, warning) = lib.list();
        assert!(entries.is_empty());
        assert!(warning.is_some());
        assert!(lib
            .create("X", "/x", "/", "", &[])
            .is_err());
    }

    #[test]
    fn foreign_entries_survive_create() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        lib.create("A", "/a", "/", "", &[]).unwrap();
        lib.create("B", "/b", "/", "", &[]).unwrap();
        lib.delete(dock_core::vdf::derive_app_id("/a", "A")).unwrap();
        let (entries, _) = lib.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "B");
    }

    #[test]
    fn artwork_lands_under_grid_dir() {
        let dir = tempfile::tempdir().unwrap();
        let lib = lib_in(dir.path());
        let src = dir.path().join("cover.png");
        std::fs::write(&src, b"imagebytes").unwrap();
        let dest = lib.apply_artwork(123, "grid", &src).unwrap();
        assert!(dest.ends_with("123_grid.png"));
        assert_eq!(std::fs::read(dest).unwrap(), b"imagebytes");
    }
}
