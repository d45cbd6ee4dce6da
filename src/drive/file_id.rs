// 文件ID解析

use regex::Regex;
use std::sync::OnceLock;

/// 分享链接格式：
/// - `/file/d/<id>/`
/// - `/a/<domain>/file/d/<id>/`
/// - `/host/<id>`
/// - `/open?id=<id>`
const SHARE_LINK_PATTERN: &str = r"^(?:https?://)?(?:www\.)?(?:(?:drive\.google|googledrive)\.com/)(?:file/d/|a/[^/]+/file/d/|host/|open\?id=)([A-Za-z0-9_-]{10,40})(?:\?|/)?";

fn share_link_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SHARE_LINK_PATTERN).ok()).as_ref()
}

/// 从分享链接中提取文件ID
///
/// 不匹配任何链接格式时原样返回（视为已经是文件ID）
pub fn extract_remote_id(reference: &str) -> String {
    share_link_regex()
        .and_then(|re| re.captures(reference))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| reference.to_string())
}
