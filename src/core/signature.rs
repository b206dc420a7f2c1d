//! 内容签名
//!
//! 只对两侧大小相同的文件计算 BLAKE3，大小不同的文件无需签名即可判定为不同。

use super::entry::ScanResult;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 计算完整内容的 BLAKE3 哈希（十六进制）
pub fn calculate_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 两侧都是文件且大小相同的路径
pub fn signature_candidates(a: &ScanResult, b: &ScanResult) -> Vec<String> {
    let mut paths: Vec<String> = a
        .entries()
        .iter()
        .filter(|(_, entry)| entry.is_file())
        .filter_map(|(path, entry)| {
            b.get(path)
                .filter(|other| other.is_file() && other.size() == entry.size())
                .map(|_| path.clone())
        })
        .collect();
    paths.sort();
    paths
}

/// 并发计算一组文件的签名
///
/// 单个文件失败只记录警告，该文件不带签名，比较时退回到元数据判断。
/// 取消后不再启动新的计算。
pub async fn compute_signatures(
    storage: Arc<dyn Storage>,
    paths: Vec<String>,
    parallelism: usize,
    cancel: &CancellationToken,
) -> HashMap<String, String> {
    if paths.is_empty() {
        return HashMap::new();
    }

    info!("计算内容签名: {} ({} 个文件)", storage.name(), paths.len());
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks = JoinSet::new();

    for path in paths {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancel.cancelled() => break,
        };
        let storage = storage.clone();
        tasks.spawn(async move {
            let result = storage.signature(&path).await;
            drop(permit);
            (path, result)
        });
    }

    let mut signatures = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((path, Ok(sig))) => {
                debug!("签名 {}: {}", path, sig);
                signatures.insert(path, sig);
            }
            Ok((path, Err(e))) => warn!("无法计算签名 {}: {}", path, e),
            Err(e) => warn!("签名任务失败: {}", e),
        }
    }

    info!("签名完成: {} ({} 个)", storage.name(), signatures.len());
    signatures
}
