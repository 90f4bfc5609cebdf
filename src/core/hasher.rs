//! 内容哈希

use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// 对完整文件内容计算确定性的摘要
#[async_trait]
pub trait ContentHasher: Send + Sync {
    async fn hash(&self, path: &Path) -> io::Result<String>;
}

/// BLAKE3 流式哈希，按块读取，内存占用与文件大小无关
#[derive(Debug, Clone)]
pub struct Blake3Hasher {
    chunk_size: usize,
}

impl Blake3Hasher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(4096),
        }
    }

    fn hash_blocking(path: &Path, chunk_size: usize) -> io::Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; chunk_size];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.finalize().to_hex().to_string())
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

#[async_trait]
impl ContentHasher for Blake3Hasher {
    async fn hash(&self, path: &Path) -> io::Result<String> {
        let path: PathBuf = path.to_path_buf();
        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || Self::hash_blocking(&path, chunk_size))
            .await
            .map_err(io::Error::other)?
    }
}
