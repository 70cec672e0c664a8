//! Turtle bootstrap file
//!
//! A tiny text file holding the metadata table's latest checkpoint cookie.
//! It is the root of recovery: everything else is found through the
//! metadata table it points at. Writes go to a temporary file which is
//! atomically renamed into place, then the directory is synced.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::constants::{TURTLE_FILE, TURTLE_FILE_TMP, TURTLE_HEADER, VERSION_MAJOR, VERSION_MINOR};
use crate::error::{Result, TernError};
use crate::fh::sync_dir;

/// Persist the metadata checkpoint cookie
pub fn turtle_write(home: &Path, meta_cookie: &[u8]) -> Result<()> {
  let body = format!(
    "{TURTLE_HEADER}\nversion {VERSION_MAJOR}.{VERSION_MINOR}\nmetadata {}\n",
    hex_encode(meta_cookie)
  );
  let checksum = crc32fast::hash(body.as_bytes());
  let content = format!("{body}checksum {checksum:08x}\n");

  let tmp_path = home.join(TURTLE_FILE_TMP);
  let final_path = home.join(TURTLE_FILE);
  {
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
  }
  fs::rename(&tmp_path, &final_path)?;
  sync_dir(home)?;
  Ok(())
}

/// Load the metadata checkpoint cookie; `None` when no turtle exists yet
pub fn turtle_read(home: &Path) -> Result<Option<Vec<u8>>> {
  let path = home.join(TURTLE_FILE);
  let content = match fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(TernError::Io(e)),
  };

  let (body, checksum_line) = content
    .rsplit_once("checksum ")
    .ok_or_else(|| TernError::Corruption("turtle file missing checksum".to_string()))?;
  let stored: u32 = u32::from_str_radix(checksum_line.trim(), 16)
    .map_err(|_| TernError::Corruption("turtle checksum malformed".to_string()))?;
  if crc32fast::hash(body.as_bytes()) != stored {
    return Err(TernError::Corruption("turtle checksum mismatch".to_string()));
  }

  let mut lines = body.lines();
  if lines.next() != Some(TURTLE_HEADER) {
    return Err(TernError::Corruption("turtle header mismatch".to_string()));
  }
  let _version = lines
    .next()
    .filter(|line| line.starts_with("version "))
    .ok_or_else(|| TernError::Corruption("turtle version missing".to_string()))?;
  let cookie_line = lines
    .next()
    .and_then(|line| line.strip_prefix("metadata "))
    .ok_or_else(|| TernError::Corruption("turtle metadata pointer missing".to_string()))?;
  Ok(Some(hex_decode(cookie_line)?))
}

pub(crate) fn hex_encode(data: &[u8]) -> String {
  let mut out = String::with_capacity(data.len() * 2);
  for byte in data {
    out.push_str(&format!("{byte:02x}"));
  }
  out
}

pub(crate) fn hex_decode(text: &str) -> Result<Vec<u8>> {
  if text.len() % 2 != 0 {
    return Err(TernError::Corruption("odd-length hex string".to_string()));
  }
  (0..text.len())
    .step_by(2)
    .map(|i| {
      u8::from_str_radix(&text[i..i + 2], 16)
        .map_err(|_| TernError::Corruption("bad hex digit".to_string()))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    assert!(turtle_read(dir.path()).unwrap().is_none());
    turtle_write(dir.path(), &[1, 2, 0xab, 0xcd]).unwrap();
    assert_eq!(
      turtle_read(dir.path()).unwrap().unwrap(),
      vec![1, 2, 0xab, 0xcd]
    );
    // Rewrites replace atomically
    turtle_write(dir.path(), &[9, 9]).unwrap();
    assert_eq!(turtle_read(dir.path()).unwrap().unwrap(), vec![9, 9]);
  }

  #[test]
  fn corrupted_turtle_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    turtle_write(dir.path(), &[7; 16]).unwrap();
    let path = dir.path().join(TURTLE_FILE);
    let mut content = std::fs::read_to_string(&path).unwrap();
    content = content.replace("metadata 07", "metadata 08");
    std::fs::write(&path, content).unwrap();
    assert!(matches!(
      turtle_read(dir.path()),
      Err(TernError::Corruption(_))
    ));
  }

  #[test]
  fn hex_roundtrip() {
    let data = vec![0u8, 255, 16, 1];
    assert_eq!(hex_decode(&hex_encode(&data)).unwrap(), data);
    assert!(hex_decode("abc").is_err());
    assert!(hex_decode("zz").is_err());
  }
}
