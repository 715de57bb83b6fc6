//! 忽略规则
//!
//! 支持的 glob 语法：
//! - `*` 匹配除 `/` 以外的任意字符，`?` 匹配单个字符
//! - `**` 跨目录匹配
//! - 以 `/` 结尾只匹配目录（及其内容）
//! - 以 `/` 开头或中间含 `/` 的模式相对根目录锚定，否则匹配任意层级的名称
//!
//! 匹配不区分大小写；目录被忽略时其下所有路径也被忽略。

use crate::error::{SyncError, SyncResult};
use regex::{RegexSet, RegexSetBuilder};

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: RegexSet,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> SyncResult<Self> {
        let patterns: Vec<String> = patterns
            .iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty() && !p.starts_with('#'))
            .collect();

        let regexes: Vec<String> = patterns.iter().map(|p| glob_to_regex(p)).collect();
        let set = RegexSetBuilder::new(&regexes)
            .case_insensitive(true)
            .build()
            .map_err(|e| SyncError::Configuration(format!("无效的忽略规则: {}", e)))?;

        Ok(Self { patterns, set })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: RegexSet::empty(),
        }
    }

    /// 追加规则，返回新的规则集
    pub fn with_patterns<S: AsRef<str>>(&self, extra: &[S]) -> SyncResult<Self> {
        let mut all = self.patterns.clone();
        all.extend(extra.iter().map(|p| p.as_ref().to_string()));
        Self::new(&all)
    }

    pub fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        if self.patterns.is_empty() || path.is_empty() {
            return false;
        }
        if is_dir {
            self.set.is_match(&format!("{}/", path))
        } else {
            self.set.is_match(path)
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let dir_only = pattern.ends_with('/');
    let body = pattern.trim_end_matches('/');
    let anchored = body.starts_with('/') || body.contains('/');
    let body = body.trim_start_matches('/');

    let mut re = String::from("^");
    if !anchored {
        re.push_str("(.*/)?");
    }

    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    if dir_only {
        re.push_str("/.*$");
    } else {
        re.push_str("(/.*)?$");
    }
    re
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(patterns: &[&str]) -> IgnoreRules {
        IgnoreRules::new(patterns).unwrap()
    }

    #[test]
    fn test_name_matches_any_level() {
        let r = rules(&["*.tmp", "Thumbs.db"]);
        assert!(r.is_ignored("a.tmp", false));
        assert!(r.is_ignored("deep/dir/b.TMP", false));
        assert!(r.is_ignored("x/thumbs.db", false));
        assert!(!r.is_ignored("a.tmpx", false));
        assert!(!r.is_ignored("tmp/a.txt", false));
    }

    #[test]
    fn test_dir_only_pattern() {
        let r = rules(&["node_modules/"]);
        assert!(r.is_ignored("node_modules", true));
        assert!(r.is_ignored("web/node_modules", true));
        assert!(r.is_ignored("web/node_modules/pkg/index.js", false));
        assert!(!r.is_ignored("node_modules", false));
    }

    #[test]
    fn test_anchored_and_double_star() {
        let r = rules(&["/build", "docs/**/*.pdf"]);
        assert!(r.is_ignored("build", true));
        assert!(r.is_ignored("build/out.o", false));
        assert!(!r.is_ignored("src/build", true));
        assert!(r.is_ignored("docs/a.pdf", false));
        assert!(r.is_ignored("docs/x/y/a.pdf", false));
        assert!(!r.is_ignored("other/docs/a.pdf", false));
    }

    #[test]
    fn test_question_mark_and_special_chars() {
        let r = rules(&["file?.txt", "a+b (1).md"]);
        assert!(r.is_ignored("file1.txt", false));
        assert!(!r.is_ignored("file12.txt", false));
        assert!(r.is_ignored("x/a+b (1).md", false));
    }

    #[test]
    fn test_empty_and_comments() {
        let r = rules(&["", "# comment"]);
        assert!(r.patterns().is_empty());
        assert!(!r.is_ignored("anything", false));
        assert!(!IgnoreRules::empty().is_ignored("a", false));
    }

    #[test]
    fn test_with_patterns_extends() {
        let r = rules(&["*.log"]).with_patterns(&["*.synctmp*"]).unwrap();
        assert!(r.is_ignored("a.log", false));
        assert!(r.is_ignored("a.txt.synctmp1234", false));
    }
}
