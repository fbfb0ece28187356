//! Destinations for extracted volumes.

use super::extract::LogicalVolume;

use anyhow::Context;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Somewhere to put extracted volumes. Each volume is opened, written in full, then closed.
pub trait VolumeSink {
    type Output: Write;

    /// Begin writing a volume
    fn open(&mut self, volume: &LogicalVolume) -> anyhow::Result<Self::Output>;

    /// Finish writing a volume, once all of its data has been written to `output`
    fn close(&mut self, volume: &LogicalVolume, output: Self::Output) -> anyhow::Result<()>;
}

/// Writes each volume to a file named `prefix` + volume name, in some directory.
#[derive(Debug, Clone)]
pub struct DirSink {
    dir: PathBuf,
    prefix: String,
}

impl DirSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Where a volume with the given name would be written.
    ///
    /// Volume names come straight out of the image, so anything that would escape `dir` is
    /// refused.
    pub fn path_for(&self, name: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            !name.is_empty()
                && name != "."
                && name != ".."
                && !name.contains(['/', '\\', '\0']),
            "refusing to use volume name {name:?} as a file name"
        );

        Ok(self.dir.join(format!("{}{}", self.prefix, name)))
    }
}

impl VolumeSink for DirSink {
    type Output = BufWriter<File>;

    fn open(&mut self, volume: &LogicalVolume) -> anyhow::Result<Self::Output> {
        let path = self.path_for(volume.name())?;
        fs::create_dir_all(&self.dir).with_context(|| self.dir.display().to_string())?;
        let file = File::create(&path).with_context(|| path.display().to_string())?;
        Ok(BufWriter::new(file))
    }

    fn close(&mut self, volume: &LogicalVolume, mut output: Self::Output) -> anyhow::Result<()> {
        output
            .flush()
            .with_context(|| format!("writing volume {}", volume.name()))
    }
}

/// Collects volumes in memory, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub volumes: BTreeMap<String, Vec<u8>>,
}

impl VolumeSink for MemorySink {
    type Output = Vec<u8>;

    fn open(&mut self, _: &LogicalVolume) -> anyhow::Result<Self::Output> {
        Ok(Vec::new())
    }

    fn close(&mut self, volume: &LogicalVolume, output: Self::Output) -> anyhow::Result<()> {
        self.volumes.insert(volume.name().to_string(), output);
        Ok(())
    }
}

#[test]
fn test_dir_sink() -> anyhow::Result<()> {
    use super::extract::extract_volumes;
    use super::scan::scan_image;
    use super::testimage::TestImage;

    let mut image = TestImage::new(64, 128);
    image.layout_leb(0, &[(0, "rootfs"), (1, "../escape"), (2, "data")])?;
    image.static_leb(0, 0, b"root")?;
    image.static_leb(2, 0, b"more")?;
    image.static_leb(1, 0, b"nope")?;

    let result = scan_image(std::io::Cursor::new(image.into_bytes()));
    let tmp = tempfile::tempdir()?;
    let out_dir = tmp.path().join("out");
    let mut sink = DirSink::new(&out_dir, "dmp_");
    let summary = extract_volumes(&result.blocks, result.volume_table().unwrap(), &mut sink);

    assert_eq!(fs::read(out_dir.join("dmp_rootfs"))?, b"root");
    assert_eq!(fs::read(out_dir.join("dmp_data"))?, b"more");

    // The hostile name is refused, without stopping the other volumes
    assert_eq!(summary.written.len(), 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0.name(), "../escape");
    assert!(!tmp.path().join("dmp_escape").exists());
    assert!(!out_dir.join("..").join("escape").exists());

    Ok(())
}

#[test]
fn test_path_for() {
    let sink = DirSink::new("/tmp/x", "dmp_");
    assert_eq!(
        sink.path_for("rootfs").unwrap(),
        std::path::Path::new("/tmp/x/dmp_rootfs")
    );
    assert!(sink.path_for("a/b").is_err());
    assert!(sink.path_for("..").is_err());
    assert!(sink.path_for("").is_err());
}
