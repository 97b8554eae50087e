//! The scenario runner's in-memory file system.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use userfs::Backend;
use userfs::BasicInfo;
use userfs::CleanupFlags;
use userfs::CreateArgs;
use userfs::DirEntry;
use userfs::FileAccess;
use userfs::FileAttributes;
use userfs::FileInfo;
use userfs::FsError;
use userfs::FsResult;
use userfs::OpenOutcome;
use userfs::Request;
use userfs::ShareMode;
use userfs::StreamEntry;
use userfs::VolumeInfo;

#[derive(Clone, Debug, Default)]
struct MemFile {
    data: Vec<u8>,
    info: FileInfo,
}

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    handles: HashMap<u64, String>,
    next_fh: u64,
    next_index: u64,
}

/// Just enough file system to drive the engine scenarios.
#[derive(Debug)]
pub struct MemFs {
    state: Mutex<MemState>,
}

fn main_of(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

fn parent_of(name: &str) -> &str {
    let main = main_of(name);
    match main.rfind('\\') {
        Some(0) | None => "\\",
        Some(pos) => &main[..pos],
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut state = MemState::default();
        state.files.insert(
            "\\".into(),
            MemFile {
                info: FileInfo {
                    attributes: FileAttributes::DIRECTORY,
                    index_number: 1,
                    ..FileInfo::default()
                },
                ..MemFile::default()
            },
        );
        state.next_index = 1;
        MemFs {
            state: Mutex::new(state),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(name)
    }

    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(name)
            .map(|f| f.data.clone())
    }

    fn handle_name(state: &MemState, fh: u64) -> FsResult<String> {
        state
            .handles
            .get(&fh)
            .cloned()
            .ok_or(FsError::InvalidParameter)
    }
}

impl Backend for MemFs {
    fn get_volume_info(&self) -> FsResult<VolumeInfo> {
        Ok(VolumeInfo {
            total_size: 16 * 1024 * 1024,
            free_size: 12 * 1024 * 1024,
            volume_label: "SCENARIO".into(),
        })
    }

    fn create(&self, _req: &Request, name: &str, args: &CreateArgs<'_>) -> FsResult<OpenOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(name) {
            return Err(FsError::Exists);
        }
        if name.contains(':') {
            if !state.files.contains_key(main_of(name)) {
                return Err(FsError::NotFound);
            }
        } else {
            match state.files.get(parent_of(name)) {
                Some(parent) if parent.info.attributes.is_directory() => {}
                Some(_) => return Err(FsError::NotADirectory),
                None => return Err(FsError::PathNotFound),
            }
        }

        let mut attributes = args.attributes | FileAttributes::ARCHIVE;
        if args.directory {
            attributes = FileAttributes::DIRECTORY;
        }
        state.next_index += 1;
        let info = FileInfo {
            attributes,
            index_number: state.next_index,
            ..FileInfo::default()
        };
        state.files.insert(name.into(), MemFile {
            info,
            ..MemFile::default()
        });
        state.next_fh += 1;
        let fh = state.next_fh;
        state.handles.insert(fh, name.into());
        Ok(OpenOutcome { fh, info })
    }

    fn open(
        &self,
        _req: &Request,
        name: &str,
        _access: FileAccess,
        _share: ShareMode,
    ) -> FsResult<OpenOutcome> {
        let mut state = self.state.lock().unwrap();
        let info = state.files.get(name).ok_or(FsError::NotFound)?.info;
        state.next_fh += 1;
        let fh = state.next_fh;
        state.handles.insert(fh, name.into());
        Ok(OpenOutcome { fh, info })
    }

    fn overwrite(
        &self,
        _req: &Request,
        fh: u64,
        attributes: FileAttributes,
        replace_attributes: bool,
        _allocation_size: u64,
        _ea: Option<&[u8]>,
    ) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        file.data.clear();
        file.info.file_size = 0;
        if replace_attributes {
            file.info.attributes = attributes | FileAttributes::ARCHIVE;
        } else {
            file.info.attributes |= attributes;
        }
        Ok(file.info)
    }

    fn cleanup(&self, _req: &Request, _fh: u64, name: &str, flags: CleanupFlags) {
        if !flags.contains(CleanupFlags::DELETE) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.files.remove(name);
        let stream_prefix = format!("{name}:");
        let doomed: Vec<String> = state
            .files
            .range(stream_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&stream_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.files.remove(&key);
        }
    }

    fn close(&self, _req: &Request, fh: u64) {
        self.state.lock().unwrap().handles.remove(&fh);
    }

    fn get_file_info(&self, _req: &Request, fh: u64) -> FsResult<FileInfo> {
        let state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        Ok(state.files.get(&name).ok_or(FsError::NotFound)?.info)
    }

    fn set_basic_info(&self, _req: &Request, fh: u64, basic: &BasicInfo) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        if let Some(attributes) = basic.attributes {
            file.info.attributes = attributes;
        }
        Ok(file.info)
    }

    fn can_delete(&self, _req: &Request, _fh: u64, name: &str) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        let prefix = format!("{name}\\");
        if state
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .next()
            .is_some()
        {
            return Err(FsError::DirNotEmpty);
        }
        Ok(())
    }

    fn rename(
        &self,
        _req: &Request,
        _fh: u64,
        name: &str,
        new_name: &str,
        replace_if_exists: bool,
    ) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.files.contains_key(name) {
            return Err(FsError::NotFound);
        }
        if name != new_name && state.files.contains_key(new_name) {
            if !replace_if_exists {
                return Err(FsError::Exists);
            }
            state.files.remove(new_name);
        }
        let moved: Vec<String> = state
            .files
            .range(name.to_string()..)
            .take_while(|(k, _)| k.starts_with(name))
            .filter(|(k, _)| {
                k.as_str() == name
                    || matches!(k.as_bytes().get(name.len()), Some(&b'\\') | Some(&b':'))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for old_key in moved {
            let file = state.files.remove(&old_key).unwrap();
            let new_key = format!("{new_name}{}", &old_key[name.len()..]);
            let fixups: Vec<u64> = state
                .handles
                .iter()
                .filter(|(_, n)| n.as_str() == old_key)
                .map(|(&h, _)| h)
                .collect();
            for h in fixups {
                state.handles.insert(h, new_key.clone());
            }
            state.files.insert(new_key, file);
        }
        Ok(())
    }

    fn read(&self, _req: &Request, fh: u64, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        let file = state.files.get(&name).ok_or(FsError::NotFound)?;
        if offset >= file.data.len() as u64 {
            return Err(FsError::EndOfFile);
        }
        let start = offset as usize;
        let end = (start + length).min(file.data.len());
        Ok(file.data[start..end].to_vec())
    }

    fn write(
        &self,
        _req: &Request,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> FsResult<(usize, FileInfo)> {
        let mut state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        let end = offset as usize + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[offset as usize..end].copy_from_slice(data);
        file.info.file_size = file.data.len() as u64;
        file.info.allocation_size = file.info.allocation_size.max(file.info.file_size);
        Ok((data.len(), file.info))
    }

    fn flush(&self, _req: &Request, fh: u64) -> FsResult<FileInfo> {
        self.get_file_info(_req, fh)
    }

    fn read_directory(
        &self,
        _req: &Request,
        fh: u64,
        _pattern: Option<&str>,
        _marker: Option<&str>,
    ) -> FsResult<Vec<DirEntry>> {
        let state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        let prefix = if name == "\\" {
            "\\".to_string()
        } else {
            format!("{name}\\")
        };
        Ok(state
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| {
                let rest = &k[prefix.len()..];
                !rest.is_empty() && !rest.contains('\\') && !rest.contains(':')
            })
            .map(|(k, f)| DirEntry {
                name: k[prefix.len()..].into(),
                info: f.info,
            })
            .collect())
    }

    fn get_stream_info(&self, _req: &Request, fh: u64) -> FsResult<Vec<StreamEntry>> {
        let state = self.state.lock().unwrap();
        let name = Self::handle_name(&state, fh)?;
        let main = main_of(&name).to_string();
        let mut entries = Vec::new();
        if let Some(file) = state.files.get(&main) {
            if !file.info.attributes.is_directory() {
                entries.push(StreamEntry {
                    name: String::new(),
                    size: file.info.file_size,
                    allocation_size: file.info.allocation_size,
                });
            }
        }
        let prefix = format!("{main}:");
        for (k, f) in state
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            entries.push(StreamEntry {
                name: k[prefix.len()..].into(),
                size: f.info.file_size,
                allocation_size: f.info.allocation_size,
            });
        }
        Ok(entries)
    }
}
