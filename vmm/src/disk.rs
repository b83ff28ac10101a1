// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::command::CommandRunner;
use crate::{Error, Result};

/// Image format as understood by `qemu-img` and the hypervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Other(String),
}

impl DiskFormat {
    /// `.qcow2` is qcow2, `.img` and `.raw` are raw, anything else qcow2.
    pub fn from_extension(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("img") | Some("raw") => DiskFormat::Raw,
            _ => DiskFormat::Qcow2,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Other(s) => s,
        }
    }
}

impl From<&str> for DiskFormat {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "qcow2" => DiskFormat::Qcow2,
            "raw" => DiskFormat::Raw,
            other => DiskFormat::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    #[serde(rename = "virtual-size", default)]
    pub virtual_size: u64,
}

fn parse_image_info(output: &str) -> Result<ImageInfo> {
    serde_json::from_str(output)
        .map_err(|e| Error::ToolOutput("qemu-img".to_owned(), e.to_string()))
}

/// Disk image handling through `qemu-img`.
pub struct DiskTool {
    qemu_img: String,
    runner: CommandRunner,
}

impl DiskTool {
    pub fn new(qemu_img: &str, runner: CommandRunner) -> Self {
        DiskTool {
            qemu_img: qemu_img.to_owned(),
            runner,
        }
    }

    pub fn info(&self, path: &Path) -> Result<ImageInfo> {
        let path_str = path.to_string_lossy();
        let out = self
            .runner
            .run(&self.qemu_img, &["info", "--output=json", &path_str])?;
        parse_image_info(&out)
    }

    /// Format of an existing image as `qemu-img` reports it, or inferred from
    /// the extension for a future one.
    pub fn detect_format(&self, path: &Path) -> Result<DiskFormat> {
        if !path.exists() {
            return Ok(DiskFormat::from_extension(path));
        }
        let info = self.info(path)?;
        if info.format.trim().is_empty() {
            return Err(Error::ToolOutput(
                self.qemu_img.clone(),
                format!("no format reported for {}", path.display()),
            ));
        }
        Ok(DiskFormat::from(info.format.as_str()))
    }

    /// Make sure an image exists at `path`, creating a `size_gib` image when
    /// it does not, and return its format.
    pub fn ensure(&self, path: &Path, size_gib: u64) -> Result<DiskFormat> {
        if path.is_dir() {
            return Err(Error::Validation(format!(
                "disk {} is a directory",
                path.display()
            )));
        }
        if path.exists() {
            return self.detect_format(path);
        }
        if size_gib == 0 {
            return Err(Error::Validation(format!(
                "disk {} does not exist and no size was given",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let format = DiskFormat::from_extension(path);
        let path_str = path.to_string_lossy();
        let size = format!("{size_gib}G");
        self.runner.run(
            &self.qemu_img,
            &["create", "-f", format.as_str(), &path_str, &size],
        )?;
        info!("Created {format} disk {} ({size})", path.display());
        Ok(format)
    }

    /// Grow the image at `path` to `size_gib`. Images already that large are
    /// left alone, so this never shrinks. Returns whether it resized.
    pub fn grow(&self, path: &Path, size_gib: u64) -> Result<bool> {
        let requested = size_gib
            .checked_mul(1 << 30)
            .ok_or_else(|| Error::Validation(format!("disk size {size_gib}G is too large")))?;
        let info = self.info(path)?;
        if info.virtual_size == 0 {
            return Err(Error::ToolOutput(
                self.qemu_img.clone(),
                format!("zero virtual size reported for {}", path.display()),
            ));
        }
        if requested <= info.virtual_size {
            debug!(
                "Disk {} already holds {} bytes, not resizing",
                path.display(),
                info.virtual_size
            );
            return Ok(false);
        }

        let path_str = path.to_string_lossy();
        let size = format!("{size_gib}G");
        let format = info.format.trim();
        let mut args = vec!["resize"];
        if !format.is_empty() {
            args.extend(["-f", format]);
        }
        args.extend([path_str.as_ref(), size.as_str()]);
        self.runner.run(&self.qemu_img, &args)?;

        let resized = self.info(path)?;
        if resized.virtual_size < requested {
            return Err(Error::ToolOutput(
                self.qemu_img.clone(),
                format!(
                    "resize of {} did not take effect ({} bytes, wanted {requested})",
                    path.display(),
                    resized.virtual_size
                ),
            ));
        }
        info!("Grew disk {} to {size}", path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::mock::fake_tool;

    fn tool(qemu_img: &str) -> DiskTool {
        DiskTool::new(qemu_img, CommandRunner::new(Duration::from_secs(5)))
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            DiskFormat::from_extension(Path::new("/d/web.qcow2")),
            DiskFormat::Qcow2
        );
        assert_eq!(
            DiskFormat::from_extension(Path::new("/d/web.IMG")),
            DiskFormat::Raw
        );
        assert_eq!(
            DiskFormat::from_extension(Path::new("/d/web.raw")),
            DiskFormat::Raw
        );
        assert_eq!(
            DiskFormat::from_extension(Path::new("/d/web")),
            DiskFormat::Qcow2
        );
        assert_eq!(DiskFormat::from("VMDK").to_string(), "vmdk");
    }

    #[test]
    fn test_parse_image_info() {
        let info = parse_image_info(
            r#"{"virtual-size": 21474836480, "filename": "web.qcow2", "format": "qcow2", "actual-size": 200704}"#,
        )
        .unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 20 << 30);
        assert!(matches!(
            parse_image_info("qemu-img: Could not open"),
            Err(Error::ToolOutput(..))
        ));
    }

    #[test]
    fn test_detect_missing_disk() {
        let tmp = TempDir::new_with_prefix("/tmp/vmhost-disk").unwrap();
        let path = tmp.as_path().join("new.img");
        // qemu-img is never run for a disk that does not exist yet.
        let format = tool("definitely-not-a-real-qemu-img")
            .detect_format(&path)
            .unwrap();
        assert_eq!(format, DiskFormat::Raw);
    }

    #[test]
    fn test_grow() {
        let tmp = TempDir::new_with_prefix("/tmp/vmhost-disk").unwrap();
        let size_file = tmp.as_path().join("size");
        fs::write(&size_file, "10737418240").unwrap();
        let qemu_img = fake_tool(
            tmp.as_path(),
            "qemu-img",
            &format!(
                r#"case "$1" in
  info) echo "{{\"format\": \"qcow2\", \"virtual-size\": $(cat {size})}}" ;;
  resize) [ "$2" = -f ] && [ "$3" = qcow2 ] || exit 3; echo $(( ${{5%G}} * 1073741824 )) > {size} ;;
  *) exit 2 ;;
esac"#,
                size = size_file.display()
            ),
        );
        let tool = tool(&qemu_img);
        let disk = tmp.as_path().join("web.qcow2");

        assert!(tool.grow(&disk, 20).unwrap());
        assert_eq!(fs::read_to_string(&size_file).unwrap().trim(), "21474836480");
        // Never shrinks.
        assert!(!tool.grow(&disk, 15).unwrap());
        assert!(!tool.grow(&disk, 20).unwrap());
        assert_eq!(fs::read_to_string(&size_file).unwrap().trim(), "21474836480");

        assert!(matches!(tool.grow(&disk, u64::MAX), Err(Error::Validation(_))));
    }

    #[test]
    fn test_grow_unchanged_size_is_an_error() {
        let tmp = TempDir::new_with_prefix("/tmp/vmhost-disk").unwrap();
        let qemu_img = fake_tool(
            tmp.as_path(),
            "qemu-img",
            r#"[ "$1" = info ] && echo '{"format": "raw", "virtual-size": 1073741824}'; exit 0"#,
        );
        assert!(matches!(
            tool(&qemu_img).grow(&tmp.as_path().join("web.img"), 2),
            Err(Error::ToolOutput(..))
        ));
    }

    #[test]
    fn test_ensure_errors() {
        let tmp = TempDir::new_with_prefix("/tmp/vmhost-disk").unwrap();
        let tool = tool("definitely-not-a-real-qemu-img");

        assert!(matches!(
            tool.ensure(tmp.as_path(), 10),
            Err(Error::Validation(_))
        ));
        let path = tmp.as_path().join("web").join("web.qcow2");
        assert!(matches!(tool.ensure(&path, 0), Err(Error::Validation(_))));
        assert!(matches!(tool.ensure(&path, 10), Err(Error::ToolMissing(_))));
        // The parent directory is prepared before the image is created.
        assert!(tmp.as_path().join("web").is_dir());
    }
}
