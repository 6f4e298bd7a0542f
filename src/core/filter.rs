//! 过滤规则
//!
//! 在计算指纹之前应用，被排除的条目既不会被哈希，也不会被当作“已删除”。

use crate::config::FilterConfig;
use crate::core::path;
use crate::error::{Result, SyncError};
use regex::Regex;

/// 单条 glob 规则
#[derive(Debug, Clone)]
struct Glob {
    re: Regex,
    /// 模式含 `/` 时匹配完整路径，否则只匹配名称
    full_path: bool,
}

/// 编译后的过滤规则
#[derive(Debug, Clone)]
pub struct FilterRules {
    skip_dotfiles: bool,
    skip_symlinks: bool,
    skip_dirs: Vec<Glob>,
    skip_files: Vec<Glob>,
    max_file_size: u64,
    ignore_marker: Option<String>,
    sync_list: Vec<String>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            skip_dotfiles: false,
            skip_symlinks: true,
            skip_dirs: vec![],
            skip_files: vec![],
            max_file_size: 0,
            ignore_marker: None,
            sync_list: vec![],
        }
    }
}

/// 把 glob 转为正则
///
/// `**` 跨目录，`*` 和 `?` 不跨目录。不含 `/` 的模式只匹配名称，
/// 含 `/` 的模式匹配完整相对路径。
fn compile_glob(pattern: &str) -> Result<Glob> {
    let trimmed = pattern.trim_matches('/');
    let mut re = String::from("(?i)^");
    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                re.push_str(".*");
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    let re = Regex::new(&re)
        .map_err(|e| SyncError::Config(format!("无效的过滤模式 {:?}: {}", pattern, e)))?;
    Ok(Glob {
        re,
        full_path: trimmed.contains('/'),
    })
}

fn matches_any(patterns: &[Glob], rel_path: &str) -> bool {
    let name = path::file_name(rel_path);
    patterns.iter().any(|glob| {
        if glob.full_path {
            glob.re.is_match(rel_path)
        } else {
            glob.re.is_match(name)
        }
    })
}

impl FilterRules {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let compile_all = |patterns: &[String]| -> Result<Vec<Glob>> {
            patterns.iter().map(|p| compile_glob(p)).collect()
        };

        Ok(Self {
            skip_dotfiles: config.skip_dotfiles,
            skip_symlinks: config.skip_symlinks,
            skip_dirs: compile_all(&config.skip_dirs)?,
            skip_files: compile_all(&config.skip_files)?,
            max_file_size: config.max_file_size,
            ignore_marker: config
                .ignore_marker
                .as_ref()
                .filter(|m| !m.is_empty())
                .cloned(),
            sync_list: config
                .sync_list
                .iter()
                .map(|p| path::normalize_path(p))
                .filter(|p| !p.is_empty())
                .collect(),
        })
    }

    pub fn skip_symlinks(&self) -> bool {
        self.skip_symlinks
    }

    pub fn ignore_marker(&self) -> Option<&str> {
        self.ignore_marker.as_deref()
    }

    fn is_dotfile(&self, rel_path: &str) -> bool {
        self.skip_dotfiles && path::file_name(rel_path).starts_with('.')
    }

    /// 白名单：自身或祖先在列表中；目录是列表项的祖先时也要放行，否则无法遍历到
    fn sync_list_allows(&self, rel_path: &str, is_folder: bool) -> bool {
        if self.sync_list.is_empty() {
            return true;
        }
        self.sync_list.iter().any(|allowed| {
            rel_path == allowed
                || path::is_within(rel_path, allowed)
                || (is_folder && path::is_within(allowed, rel_path))
        })
    }

    /// 目录是否被排除（只看这一层）
    pub fn excludes_dir(&self, rel_path: &str) -> bool {
        self.is_dotfile(rel_path)
            || matches_any(&self.skip_dirs, rel_path)
            || !self.sync_list_allows(rel_path, true)
    }

    /// 文件是否被排除（只看这一层），`size` 未知时不做大小检查
    pub fn excludes_file(&self, rel_path: &str, size: Option<u64>) -> bool {
        if self.is_dotfile(rel_path) || matches_any(&self.skip_files, rel_path) {
            return true;
        }
        if let Some(size) = size {
            if self.max_file_size > 0 && size > self.max_file_size {
                return true;
            }
        }
        !self.sync_list_allows(rel_path, false)
    }

    /// 完整路径检查：任一祖先目录被排除，自身也被排除
    pub fn excludes_path(&self, rel_path: &str, is_folder: bool) -> bool {
        if path::ancestors(rel_path).any(|dir| self.excludes_dir(dir)) {
            return true;
        }
        if is_folder {
            self.excludes_dir(rel_path)
        } else {
            self.excludes_file(rel_path, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(config: FilterConfig) -> FilterRules {
        FilterRules::from_config(&config).unwrap()
    }

    #[test]
    fn test_default_skip_files() {
        let r = rules(FilterConfig::default());
        assert!(r.excludes_file("docs/~lock.docx", None));
        assert!(r.excludes_file("a/b/c.TMP", None));
        assert!(r.excludes_file(".DS_Store", None));
        assert!(!r.excludes_file("docs/report.docx", None));
    }

    #[test]
    fn test_dotfiles_and_dirs() {
        let r = rules(FilterConfig {
            skip_dotfiles: true,
            skip_dirs: vec!["node_modules".into(), "build/**".into()],
            ..Default::default()
        });
        assert!(r.excludes_dir(".git"));
        assert!(r.excludes_dir("web/node_modules"));
        assert!(r.excludes_dir("build/out"));
        assert!(!r.excludes_dir("src"));
        assert!(r.excludes_path("web/node_modules/x/y.js", false));
        assert!(r.excludes_path("a/.hidden/file.txt", false));
        assert!(!r.excludes_path("a/visible/file.txt", false));
    }

    #[test]
    fn test_max_size() {
        let r = rules(FilterConfig {
            max_file_size: 100,
            ..Default::default()
        });
        assert!(r.excludes_file("big.bin", Some(101)));
        assert!(!r.excludes_file("big.bin", Some(100)));
        assert!(!r.excludes_file("big.bin", None));
    }

    #[test]
    fn test_sync_list() {
        let r = rules(FilterConfig {
            sync_list: vec!["Documents/Work".into()],
            ..Default::default()
        });
        // 祖先目录必须可遍历
        assert!(!r.excludes_dir("Documents"));
        assert!(!r.excludes_dir("Documents/Work"));
        assert!(!r.excludes_file("Documents/Work/a.txt", None));
        assert!(r.excludes_file("Documents/notes.txt", None));
        assert!(r.excludes_dir("Pictures"));
        assert!(r.excludes_path("Pictures/x.jpg", false));
    }

    #[test]
    fn test_special_chars_are_literal() {
        let r = rules(FilterConfig {
            skip_files: vec!["a+b(1).txt".into()],
            ..Default::default()
        });
        assert!(r.excludes_file("x/a+b(1).txt", None));
        assert!(!r.excludes_file("x/aab1.txt", None));
    }
}
