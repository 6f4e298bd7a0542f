//! 内容指纹（BLAKE3）

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// 流式读取时的缓冲区大小
const READ_BUF_SIZE: usize = 64 * 1024;

/// 只保留前 16 字节（32 个十六进制字符），足够检测变化
fn encode(hash: blake3::Hash) -> String {
    hash.to_hex()[..32].to_string()
}

/// 计算内存数据的指纹
pub fn fingerprint_bytes(data: &[u8]) -> String {
    encode(blake3::hash(data))
}

/// 流式计算文件指纹（阻塞 IO，调用方需放在 spawn_blocking 中）
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_and_bytes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(fingerprint_file(&path).unwrap(), fingerprint_bytes(&data));
        assert_eq!(fingerprint_bytes(&data).len(), 32);
        assert_ne!(fingerprint_bytes(b"a"), fingerprint_bytes(b"b"));
    }
}
