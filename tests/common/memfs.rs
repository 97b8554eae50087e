//! Minimal in-memory back-end for the engine test suites.
//!
//! Files (and named streams) live in one ordered map keyed by canonical
//! name. Just enough semantics to drive the engine: parent checks, stream
//! entries behind `:`, reparse blobs, extended attributes, and subtree
//! rename.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use userfs::Backend;
use userfs::BasicInfo;
use userfs::CreateArgs;
use userfs::DirEntry;
use userfs::FileAccess;
use userfs::FileAttributes;
use userfs::FileInfo;
use userfs::FsError;
use userfs::FsResult;
use userfs::CleanupFlags;
use userfs::OpenOutcome;
use userfs::Request;
use userfs::ShareMode;
use userfs::StreamEntry;
use userfs::VolumeInfo;

#[derive(Clone, Debug, Default)]
struct MemFile {
    data: Vec<u8>,
    info: FileInfo,
    security: Vec<u8>,
    ea: Vec<u8>,
    reparse: Option<(u32, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    handles: HashMap<u64, String>,
    next_fh: u64,
    next_index: u64,
    clock: u64,
}

/// The in-memory test file system.
#[derive(Debug)]
pub struct MemFs {
    state: Mutex<MemState>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(name: &str) -> &str {
    let main = match name.find(':') {
        Some(pos) => &name[..pos],
        None => name,
    };
    match main.rfind('\\') {
        Some(0) => "\\",
        Some(pos) => &main[..pos],
        None => "\\",
    }
}

fn main_of(name: &str) -> &str {
    match name.find(':') {
        Some(pos) => &name[..pos],
        None => name,
    }
}

fn is_stream(name: &str) -> bool {
    name.contains(':')
}

impl MemFs {
    pub fn new() -> Self {
        let mut state = MemState::default();
        state.files.insert(
            "\\".to_string(),
            MemFile {
                info: FileInfo {
                    attributes: FileAttributes::DIRECTORY,
                    index_number: 1,
                    ..FileInfo::default()
                },
                ..MemFile::default()
            },
        );
        state.next_index = 2;
        MemFs {
            state: Mutex::new(state),
        }
    }

    /// Does a file exist right now (engine-independent check)?
    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(name)
    }

    /// Raw file content (engine-independent check).
    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(name)
            .map(|f| f.data.clone())
    }

    fn check_parent(state: &MemState, name: &str) -> FsResult<()> {
        if is_stream(name) {
            // the main file is the stream's parent for existence purposes
            let main = main_of(name);
            return match state.files.get(main) {
                Some(_) => Ok(()),
                None => Err(FsError::NotFound),
            };
        }
        let parent = parent_of(name);
        match state.files.get(parent) {
            Some(file) if file.info.attributes.contains(FileAttributes::DIRECTORY) => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::PathNotFound),
        }
    }

    fn open_handle(state: &mut MemState, name: &str) -> u64 {
        state.next_fh += 1;
        let fh = state.next_fh;
        state.handles.insert(fh, name.to_string());
        fh
    }

    fn file_of(state: &MemState, fh: u64) -> FsResult<(&str, &MemFile)> {
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .as_str();
        let file = state.files.get(name).ok_or(FsError::NotFound)?;
        Ok((name, file))
    }
}

impl Backend for MemFs {
    fn get_volume_info(&self) -> FsResult<VolumeInfo> {
        Ok(VolumeInfo {
            total_size: 64 * 1024 * 1024,
            free_size: 48 * 1024 * 1024,
            volume_label: "MEMFS".to_string(),
        })
    }

    fn get_security_by_name(&self, _req: &Request, name: &str) -> FsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let file = state.files.get(name).ok_or(FsError::NotFound)?;
        Ok(file.security.clone())
    }

    fn create(&self, _req: &Request, name: &str, args: &CreateArgs<'_>) -> FsResult<OpenOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(name) {
            return Err(FsError::Exists);
        }
        Self::check_parent(&state, name)?;

        let mut attributes = args.attributes | FileAttributes::ARCHIVE;
        if args.directory {
            attributes |= FileAttributes::DIRECTORY;
            attributes -= FileAttributes::ARCHIVE;
        }
        if is_stream(name) {
            attributes -= FileAttributes::DIRECTORY;
        }

        state.clock += 1;
        state.next_index += 1;
        let info = FileInfo {
            attributes,
            allocation_size: args.allocation_size,
            creation_time: state.clock,
            last_access_time: state.clock,
            last_write_time: state.clock,
            change_time: state.clock,
            index_number: state.next_index,
            ..FileInfo::default()
        };
        let file = MemFile {
            info,
            security: args.security.map(<[u8]>::to_vec).unwrap_or_default(),
            ea: args.ea.map(<[u8]>::to_vec).unwrap_or_default(),
            ..MemFile::default()
        };
        state.files.insert(name.to_string(), file);
        let fh = Self::open_handle(&mut state, name);
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
        Self::check_parent(&state, name)?;
        let info = state
            .files
            .get(name)
            .ok_or(FsError::NotFound)?
            .info;
        let fh = Self::open_handle(&mut state, name);
        Ok(OpenOutcome { fh, info })
    }

    fn overwrite(
        &self,
        _req: &Request,
        fh: u64,
        attributes: FileAttributes,
        replace_attributes: bool,
        allocation_size: u64,
        ea: Option<&[u8]>,
    ) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let clock = state.clock;
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        file.data.clear();
        if replace_attributes {
            file.info.attributes = attributes | FileAttributes::ARCHIVE;
        } else {
            file.info.attributes |= attributes | FileAttributes::ARCHIVE;
        }
        if let Some(ea) = ea {
            file.ea = ea.to_vec();
        }
        file.info.file_size = 0;
        file.info.allocation_size = allocation_size;
        file.info.last_write_time = clock;
        file.info.change_time = clock;
        Ok(file.info)
    }

    fn cleanup(&self, _req: &Request, fh: u64, name: &str, flags: CleanupFlags) {
        let mut state = self.state.lock().unwrap();
        let _ = fh;
        if flags.contains(CleanupFlags::DELETE) {
            state.files.remove(name);
            if !is_stream(name) {
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
        } else if flags.contains(CleanupFlags::SET_ALLOCATION_SIZE) {
            if let Some(file) = state.files.get_mut(name) {
                let size = file.info.file_size;
                file.info.allocation_size = size;
                file.data.truncate(size as usize);
            }
        }
    }

    fn close(&self, _req: &Request, fh: u64) {
        self.state.lock().unwrap().handles.remove(&fh);
    }

    fn get_file_info(&self, _req: &Request, fh: u64) -> FsResult<FileInfo> {
        let state = self.state.lock().unwrap();
        let (_, file) = Self::file_of(&state, fh)?;
        Ok(file.info)
    }

    fn set_basic_info(&self, _req: &Request, fh: u64, basic: &BasicInfo) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        if let Some(attributes) = basic.attributes {
            file.info.attributes = attributes;
        }
        if basic.creation_time != 0 {
            file.info.creation_time = basic.creation_time;
        }
        if basic.last_access_time != 0 {
            file.info.last_access_time = basic.last_access_time;
        }
        if basic.last_write_time != 0 {
            file.info.last_write_time = basic.last_write_time;
        }
        if basic.change_time != 0 {
            file.info.change_time = basic.change_time;
        }
        Ok(file.info)
    }

    fn set_allocation_size(
        &self,
        _req: &Request,
        fh: u64,
        allocation_size: u64,
    ) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        file.info.allocation_size = allocation_size;
        if file.info.file_size > allocation_size {
            file.info.file_size = allocation_size;
            file.data.truncate(allocation_size as usize);
        }
        Ok(file.info)
    }

    fn set_file_size(&self, _req: &Request, fh: u64, file_size: u64) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        file.data.resize(file_size as usize, 0);
        file.info.file_size = file_size;
        if file.info.allocation_size < file_size {
            file.info.allocation_size = file_size;
        }
        Ok(file.info)
    }

    fn can_delete(&self, _req: &Request, _fh: u64, name: &str) -> FsResult<()> {
        let state = self.state.lock().unwrap();
        let file = state.files.get(name).ok_or(FsError::NotFound)?;
        if file.info.attributes.contains(FileAttributes::DIRECTORY) {
            let child_prefix = format!("{name}\\");
            let has_children = state
                .files
                .range(child_prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&child_prefix))
                .next()
                .is_some();
            if has_children {
                return Err(FsError::DirNotEmpty);
            }
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

        // move the file, its streams, and (for directories) the subtree
        let moved: Vec<String> = state
            .files
            .range(name.to_string()..)
            .take_while(|(k, _)| k.starts_with(name))
            .filter(|(k, _)| {
                k.as_str() == name
                    || k.as_bytes().get(name.len()) == Some(&b'\\')
                    || k.as_bytes().get(name.len()) == Some(&b':')
            })
            .map(|(k, _)| k.clone())
            .collect();
        for old_key in moved {
            let file = state.files.remove(&old_key).unwrap();
            let new_key = format!("{new_name}{}", &old_key[name.len()..]);
            // fix up open handles pointing at the moved names
            let handle_fixups: Vec<u64> = state
                .handles
                .iter()
                .filter(|(_, handle_name)| handle_name.as_str() == old_key)
                .map(|(&h, _)| h)
                .collect();
            for h in handle_fixups {
                state.handles.insert(h, new_key.clone());
            }
            state.files.insert(new_key, file);
        }
        Ok(())
    }

    fn read(&self, _req: &Request, fh: u64, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let (_, file) = Self::file_of(&state, fh)?;
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
        state.clock += 1;
        let clock = state.clock;
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        let end = offset as usize + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[offset as usize..end].copy_from_slice(data);
        file.info.file_size = file.data.len() as u64;
        if file.info.allocation_size < file.info.file_size {
            file.info.allocation_size = file.info.file_size;
        }
        file.info.last_write_time = clock;
        file.info.change_time = clock;
        Ok((data.len(), file.info))
    }

    fn flush(&self, _req: &Request, fh: u64) -> FsResult<FileInfo> {
        let state = self.state.lock().unwrap();
        let (_, file) = Self::file_of(&state, fh)?;
        Ok(file.info)
    }

    fn read_directory(
        &self,
        _req: &Request,
        fh: u64,
        _pattern: Option<&str>,
        _marker: Option<&str>,
    ) -> FsResult<Vec<DirEntry>> {
        let state = self.state.lock().unwrap();
        let (name, file) = Self::file_of(&state, fh)?;
        if !file.info.attributes.contains(FileAttributes::DIRECTORY) {
            return Err(FsError::NotADirectory);
        }
        let prefix = if name == "\\" {
            "\\".to_string()
        } else {
            format!("{name}\\")
        };
        let entries = state
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| {
                let rest = &k[prefix.len()..];
                !rest.is_empty() && !rest.contains('\\') && !rest.contains(':')
            })
            .map(|(k, f)| DirEntry {
                name: k[prefix.len()..].to_string(),
                info: f.info,
            })
            .collect();
        Ok(entries)
    }

    fn read_ea(&self, _req: &Request, fh: u64) -> FsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let (_, file) = Self::file_of(&state, fh)?;
        Ok(file.ea.clone())
    }

    fn write_ea(&self, _req: &Request, fh: u64, ea: &[u8]) -> FsResult<FileInfo> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        file.ea = ea.to_vec();
        file.info.ea_size = ea.len() as u32;
        Ok(file.info)
    }

    fn get_reparse_point(&self, _req: &Request, fh: u64) -> FsResult<(u32, Vec<u8>)> {
        let state = self.state.lock().unwrap();
        let (_, file) = Self::file_of(&state, fh)?;
        file.reparse.clone().ok_or(FsError::NotAReparsePoint)
    }

    fn set_reparse_point(&self, _req: &Request, fh: u64, tag: u32, data: &[u8]) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        file.reparse = Some((tag, data.to_vec()));
        file.info.attributes |= FileAttributes::REPARSE_POINT;
        file.info.reparse_tag = tag;
        Ok(())
    }

    fn delete_reparse_point(&self, _req: &Request, fh: u64, tag: u32) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = state
            .handles
            .get(&fh)
            .ok_or(FsError::InvalidParameter)?
            .clone();
        let file = state.files.get_mut(&name).ok_or(FsError::NotFound)?;
        match &file.reparse {
            Some((stored, _)) if *stored == tag => {
                file.reparse = None;
                file.info.attributes -= FileAttributes::REPARSE_POINT;
                file.info.reparse_tag = 0;
                Ok(())
            }
            Some(_) => Err(FsError::ReparseTagInvalid),
            None => Err(FsError::NotAReparsePoint),
        }
    }

    fn get_stream_info(&self, _req: &Request, fh: u64) -> FsResult<Vec<StreamEntry>> {
        let state = self.state.lock().unwrap();
        let (name, _) = Self::file_of(&state, fh)?;
        let main = main_of(name).to_string();
        let mut entries = Vec::new();
        if let Some(file) = state.files.get(&main) {
            if !file.info.attributes.contains(FileAttributes::DIRECTORY) {
                entries.push(StreamEntry {
                    name: String::new(),
                    size: file.info.file_size,
                    allocation_size: file.info.allocation_size,
                });
            }
        }
        let stream_prefix = format!("{main}:");
        for (k, f) in state
            .files
            .range(stream_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&stream_prefix))
        {
            entries.push(StreamEntry {
                name: k[stream_prefix.len()..].to_string(),
                size: f.info.file_size,
                allocation_size: f.info.allocation_size,
            });
        }
        Ok(entries)
    }
}
