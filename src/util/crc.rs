//! CRC32C helpers

/// Compute CRC32 over a single buffer
pub fn crc32c(data: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(data);
  hasher.finalize()
}

/// Compute CRC32 over multiple buffers as if concatenated
pub fn crc32c_multi(segments: &[&[u8]]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  for segment in segments {
    hasher.update(segment);
  }
  hasher.finalize()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_multi_matches_concat() {
    let whole = crc32c(b"hello-world");
    let split = crc32c_multi(&[b"hello", b"-", b"world"]);
    assert_eq!(whole, split);
  }

  #[test]
  fn test_differs_on_change() {
    assert_ne!(crc32c(b"abc"), crc32c(b"abd"));
  }
}
