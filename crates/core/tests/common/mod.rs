#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use image::{Rgb, RgbImage};
use rawvert_core::{
    ConvertOptions, Converter, DecodeError, DecodeOptions, MetadataError, MetadataReport,
    MetadataTransfer, RawDecoder, SpaceProbe,
};

pub const PLENTY: u64 = 1 << 40;

/// Decodes anything into a tiny image, except files whose content marks
/// them as broken.
pub struct FakeDecoder;

impl RawDecoder for FakeDecoder {
    fn decode(&self, path: &Path, _options: &DecodeOptions) -> Result<RgbImage, DecodeError> {
        let content = fs::read_to_string(path)?;
        if content.contains("CORRUPT") {
            return Err(DecodeError::Parse(format!(
                "{}: unexpected end of file",
                path.display()
            )));
        }
        if content.contains("BOOM") {
            return Err(DecodeError::Unexpected("decoder crashed".to_string()));
        }
        Ok(RgbImage::from_pixel(2, 2, Rgb([120, 80, 40])))
    }
}

/// Records every copy; fails when the source content says so.
#[derive(Clone, Default)]
pub struct FakeMetadata {
    pub calls: Rc<RefCell<Vec<(PathBuf, PathBuf)>>>,
}

impl MetadataTransfer for FakeMetadata {
    fn copy_metadata(&self, source: &Path, target: &Path) -> Result<MetadataReport, MetadataError> {
        self.calls
            .borrow_mut()
            .push((source.to_path_buf(), target.to_path_buf()));
        let content = fs::read_to_string(source).unwrap_or_default();
        if content.contains("NOMETA") {
            return Err(MetadataError::Failed("no metadata block".to_string()));
        }
        Ok(MetadataReport {
            warnings: vec!["Warning: [minor] Unrecognized MakerNotes".to_string()],
        })
    }
}

/// Free-space figures in order; the last one repeats.
pub struct ScriptedProbe {
    values: VecDeque<u64>,
    last: u64,
}

impl ScriptedProbe {
    pub fn new(values: &[u64]) -> Self {
        Self {
            values: values.iter().copied().collect(),
            last: 0,
        }
    }

    pub fn fixed(value: u64) -> Self {
        Self::new(&[value])
    }
}

impl SpaceProbe for ScriptedProbe {
    fn free_bytes(&mut self, _path: &Path) -> Result<u64> {
        if let Some(value) = self.values.pop_front() {
            self.last = value;
        }
        Ok(self.last)
    }
}

pub fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, content).expect("write file");
}

pub fn key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Root with two good raw files and one corrupt one, canonicalized.
pub fn library_with_one_corrupt(dir: &Path) -> PathBuf {
    write(&dir.join("2024/IMG_0001.CR2"), "raw one");
    write(&dir.join("2024/IMG_0002.nef"), "raw two");
    write(&dir.join("2023/DSC_0003.ARW"), "CORRUPT");
    dir.canonicalize().expect("canonicalize")
}

pub fn options(root: &Path) -> ConvertOptions {
    ConvertOptions {
        root: root.to_path_buf(),
        required_bytes: 100,
        ..ConvertOptions::default()
    }
}

pub fn converter(options: ConvertOptions, probe: ScriptedProbe) -> Converter {
    Converter::new(options)
        .with_decoder(FakeDecoder)
        .with_metadata(FakeMetadata::default())
        .with_space_probe(probe)
}
