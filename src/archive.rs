//! Archive (jar) reading and deterministic rewriting.
//!
//! Output archives store every entry uncompressed with the zip epoch as
//! modification time, so identical inputs always produce identical bytes.

use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::registry::Discovery;
use crate::scan::{ScanStats, transform_entry};
use crate::weave::Weaver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub is_dir: bool,
    pub data: Vec<u8>,
}

/// Reads every member of the archive at `path`, in central directory order.
pub fn read_members(path: &Path) -> Result<Vec<Member>> {
    let file = File::open(path).with_context(|| format!("Failed to open jar: {}", path.display()))?;
    // SAFETY: The file is opened read-only and outlives the mapping; inputs
    // are not written while the build runs the transform.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap jar: {}", path.display()))?;
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", path.display()))?;

    let mut members = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read entry {i} of {}", path.display()))?;
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();
        let mut data = Vec::with_capacity(entry.size() as usize);
        if !is_dir {
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("Failed to inflate {name} in {}", path.display()))?;
        }
        members.push(Member { name, is_dir, data });
    }
    Ok(members)
}

/// Writes `members` in order as a fresh archive at `path`.
pub fn write_stored(path: &Path, members: &[Member]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create jar: {}", path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default());

    for member in members {
        if member.is_dir {
            zip.add_directory(member.name.as_str(), options)?;
        } else {
            zip.start_file(member.name.as_str(), options)?;
            zip.write_all(&member.data)?;
        }
    }
    let mut writer = zip
        .finish()
        .with_context(|| format!("Failed to finish jar: {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Transforms every member of `input` in parallel on the current pool and
/// writes the result, in member order, to `output`.
pub fn transform_archive(
    weaver: &Weaver,
    excluded_prefixes: &[String],
    input_index: u32,
    input: &Path,
    output: &Path,
) -> Result<ScanStats> {
    let origin = input.to_string_lossy().to_string();
    let members = read_members(input)?;

    let transformed: Vec<(Member, ScanStats)> = members
        .into_par_iter()
        .enumerate()
        .map(|(index, member)| {
            if member.is_dir {
                return (member, ScanStats::default());
            }
            let discovery = Discovery::new(input_index, index as u32, member.name.as_str());
            let (data, stats) = transform_entry(
                weaver,
                excluded_prefixes,
                &member.name,
                member.data,
                discovery,
                &origin,
            );
            (
                Member {
                    name: member.name,
                    is_dir: false,
                    data,
                },
                stats,
            )
        })
        .collect();

    let mut stats = ScanStats::default();
    let mut members = Vec::with_capacity(transformed.len());
    for (member, entry_stats) in transformed {
        stats.merge(&entry_stats);
        members.push(member);
    }
    write_stored(output, &members)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "creation_archive_test_{}_{}_{}.jar",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_deflated(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        zip.add_directory("META-INF/", FileOptions::default()).unwrap();
        for (name, data) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn rewritten_archives_are_stored_and_pinned_to_the_epoch() -> Result<()> {
        let input = temp_path("input");
        let output = temp_path("output");
        write_deflated(&input, &[("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n")]);

        let members = read_members(&input)?;
        assert_eq!(members.len(), 2);
        assert!(members[0].is_dir);
        write_stored(&output, &members)?;

        let file = File::open(&output)?;
        let mut archive = ZipArchive::new(file)?;
        assert_eq!(archive.len(), 2);
        assert!(archive.by_index(0)?.is_dir());
        let entry = archive.by_name("META-INF/MANIFEST.MF")?;
        assert_eq!(entry.compression(), CompressionMethod::Stored);
        assert_eq!(entry.size(), entry.compressed_size());
        let modified = entry.last_modified();
        assert_eq!(
            (modified.year(), modified.month(), modified.day(), modified.hour()),
            (1980, 1, 1, 0)
        );
        drop(entry);

        let _ = std::fs::remove_file(input);
        let _ = std::fs::remove_file(output);
        Ok(())
    }

    #[test]
    fn identical_members_give_identical_bytes() -> Result<()> {
        let first = temp_path("first");
        let second = temp_path("second");
        let members = vec![
            Member {
                name: "a/".to_string(),
                is_dir: true,
                data: Vec::new(),
            },
            Member {
                name: "a/B.class".to_string(),
                is_dir: false,
                data: vec![0xCA, 0xFE, 0xBA, 0xBE],
            },
        ];
        write_stored(&first, &members)?;
        write_stored(&second, &members)?;
        assert_eq!(std::fs::read(&first)?, std::fs::read(&second)?);

        let _ = std::fs::remove_file(first);
        let _ = std::fs::remove_file(second);
        Ok(())
    }
}
