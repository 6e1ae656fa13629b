// Manifest metadata section

use std::io::{Read, Seek, SeekFrom, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::common::error::Result;
use crate::manifest::stream::{read_fstring, read_u32, read_u8, write_fstring, write_u32, write_u8};

/// Build metadata carried at the front of every manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMeta {
    pub data_version: u8,
    pub feature_level: u32,
    pub is_file_data: bool,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    /// Stored build id (data_version >= 1); derived from the other meta
    /// fields when absent, see [`ManifestMeta::build_id`]
    pub build_id: String,
    pub uninstall_action_path: String,
    pub uninstall_action_args: String,
}

impl Default for ManifestMeta {
    fn default() -> Self {
        Self {
            data_version: 0,
            feature_level: 18,
            is_file_data: false,
            app_id: 0,
            app_name: String::new(),
            build_version: String::new(),
            launch_exe: String::new(),
            launch_command: String::new(),
            prereq_ids: Vec::new(),
            prereq_name: String::new(),
            prereq_path: String::new(),
            prereq_args: String::new(),
            build_id: String::new(),
            uninstall_action_path: String::new(),
            uninstall_action_args: String::new(),
        }
    }
}

impl ManifestMeta {
    /// The stored build id, or the derived one when none was stored:
    /// url-safe unpadded base64 of the SHA-1 over app id, app name, build
    /// version, launch exe and launch command.
    pub fn build_id(&self) -> String {
        if !self.build_id.is_empty() {
            return self.build_id.clone();
        }
        let mut hasher = Sha1::new();
        hasher.update(self.app_id.to_le_bytes());
        hasher.update(self.app_name.as_bytes());
        hasher.update(self.build_version.as_bytes());
        hasher.update(self.launch_exe.as_bytes());
        hasher.update(self.launch_command.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Make the derived build id stored, so serialisation and the
    /// in-memory value agree.
    pub(crate) fn ensure_build_id(&mut self) {
        if self.build_id.is_empty() {
            self.build_id = self.build_id();
        }
    }

    pub fn read(r: &mut (impl Read + Seek)) -> Result<Self> {
        let start = r.stream_position()?;
        let size = read_u32(r)?;
        let mut meta = ManifestMeta {
            data_version: read_u8(r)?,
            feature_level: read_u32(r)?,
            is_file_data: read_u8(r)? == 1,
            app_id: read_u32(r)?,
            ..Default::default()
        };
        meta.app_name = read_fstring(r)?;
        meta.build_version = read_fstring(r)?;
        meta.launch_exe = read_fstring(r)?;
        meta.launch_command = read_fstring(r)?;

        let entries = read_u32(r)?;
        for _ in 0..entries {
            meta.prereq_ids.push(read_fstring(r)?);
        }
        meta.prereq_name = read_fstring(r)?;
        meta.prereq_path = read_fstring(r)?;
        meta.prereq_args = read_fstring(r)?;

        if meta.data_version >= 1 {
            meta.build_id = read_fstring(r)?;
        }
        if meta.data_version >= 2 {
            meta.uninstall_action_path = read_fstring(r)?;
            meta.uninstall_action_args = read_fstring(r)?;
        }

        let read_bytes = r.stream_position()? - start;
        if read_bytes != size as u64 {
            log::warn!(
                "Did not read entire manifest metadata! Version: {}, {} bytes missing, skipping...",
                meta.data_version,
                size as i64 - read_bytes as i64
            );
            r.seek(SeekFrom::Start(start + size as u64))?;
            // prevent re-serialising fields we did not understand
            meta.data_version = 0;
        }

        Ok(meta)
    }

    pub fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let start = w.stream_position()?;
        write_u32(w, 0)?; // placeholder size
        write_u8(w, self.data_version)?;
        write_u32(w, self.feature_level)?;
        write_u8(w, self.is_file_data as u8)?;
        write_u32(w, self.app_id)?;
        write_fstring(w, &self.app_name)?;
        write_fstring(w, &self.build_version)?;
        write_fstring(w, &self.launch_exe)?;
        write_fstring(w, &self.launch_command)?;

        write_u32(w, self.prereq_ids.len() as u32)?;
        for prereq_id in &self.prereq_ids {
            write_fstring(w, prereq_id)?;
        }
        write_fstring(w, &self.prereq_name)?;
        write_fstring(w, &self.prereq_path)?;
        write_fstring(w, &self.prereq_args)?;

        if self.data_version >= 1 {
            write_fstring(w, &self.build_id())?;
        }
        if self.data_version >= 2 {
            write_fstring(w, &self.uninstall_action_path)?;
            write_fstring(w, &self.uninstall_action_args)?;
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(start))?;
        write_u32(w, (end - start) as u32)?;
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_meta() -> ManifestMeta {
        ManifestMeta {
            app_name: "SampleApp".to_string(),
            build_version: "1.4.2+build7".to_string(),
            launch_exe: "bin/sample".to_string(),
            launch_command: "-fullscreen".to_string(),
            prereq_ids: vec!["vcredist_x64".to_string()],
            prereq_name: "VC Redist".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_meta_roundtrip_v0() {
        let meta = sample_meta();
        let mut buf = Cursor::new(Vec::new());
        meta.write(&mut buf).unwrap();
        let restored = ManifestMeta::read(&mut Cursor::new(&buf.into_inner())).unwrap();
        assert_eq!(restored, meta);
    }

    #[test]
    fn test_meta_roundtrip_v2() {
        let mut meta = sample_meta();
        meta.data_version = 2;
        meta.build_id = "abc-123".to_string();
        meta.uninstall_action_path = "uninstall.exe".to_string();
        meta.uninstall_action_args = "/silent".to_string();

        let mut buf = Cursor::new(Vec::new());
        meta.write(&mut buf).unwrap();
        let restored = ManifestMeta::read(&mut Cursor::new(&buf.into_inner())).unwrap();
        assert_eq!(restored, meta);
    }

    #[test]
    fn test_stored_build_id_wins() {
        let mut meta = sample_meta();
        meta.build_id = "stored-id".to_string();
        assert_eq!(meta.build_id(), "stored-id");
    }

    #[test]
    fn test_derived_build_id_shape() {
        let meta = sample_meta();
        let id = meta.build_id();
        assert!(!id.is_empty());
        // url-safe alphabet, no padding
        assert!(!id.contains('+') && !id.contains('/') && !id.contains('='));
        // deterministic, and sensitive to the inputs
        assert_eq!(id, sample_meta().build_id());
        let mut other = sample_meta();
        other.build_version = "1.4.3".to_string();
        assert_ne!(id, other.build_id());
    }

    #[test]
    fn test_unknown_tail_downgrades_version() {
        let mut meta = sample_meta();
        meta.data_version = 1;
        meta.build_id = "id".to_string();
        let mut buf = Cursor::new(Vec::new());
        meta.write(&mut buf).unwrap();
        let mut bytes = buf.into_inner();

        bytes.extend_from_slice(&[0u8; 6]);
        let new_size = (bytes.len() as u32).to_le_bytes();
        bytes[..4].copy_from_slice(&new_size);

        let restored = ManifestMeta::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(restored.data_version, 0);
        assert_eq!(restored.app_name, meta.app_name);
    }
}
