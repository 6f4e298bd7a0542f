//! 规范化相对路径
//!
//! 两端看到的文件名可能是不同的 Unicode 规范化形式（macOS 常见 NFD，
//! Linux/Windows 与大多数云端为 NFC）。所有比较前统一转为 NFC，
//! 分隔符统一为 `/`，不带首尾斜杠，根目录为空串。
//!
//! 规范形式一旦确定就不能再改：状态库里保存的上次同步快照都以它为键。

use std::path::Path;
use unicode_normalization::{is_nfc, UnicodeNormalization};

/// 将单个名称转换为 NFC
pub fn normalize_name(name: &str) -> String {
    if is_nfc(name) {
        name.to_string()
    } else {
        name.nfc().collect()
    }
}

/// 规范化相对路径
pub fn normalize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .map(normalize_name)
        .collect::<Vec<_>>()
        .join("/")
}

/// 把根目录下的相对 `Path` 转为规范路径，非 UTF-8 名称返回 None
pub fn from_relative(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(normalize_name(component.as_os_str().to_str()?));
    }
    Some(parts.join("/"))
}

/// 父目录路径，根目录下的条目返回空串
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// 路径层级（根目录下的条目为 1）
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// `path` 是否严格位于 `ancestor` 之下
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !path.is_empty();
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// 把 `old_prefix` 下的路径搬到 `new_prefix` 下
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    if !is_within(path, old_prefix) {
        return None;
    }
    let suffix = if old_prefix.is_empty() {
        path
    } else {
        &path[old_prefix.len() + 1..]
    };
    Some(join(new_prefix, suffix))
}

/// 所有祖先目录，由近及远
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let p = parent(current);
        if p.is_empty() {
            None
        } else {
            current = p;
            Some(p)
        }
    })
}
