//! 版本与运行时元信息
//!
//! - **Crate Version** → Cargo.toml（唯一权威源）
//! - **Migration Version** → migrations 文件（文件即版本，由 refinery 自动管理）
//! - **Runtime Metadata** → 本模块

use serde::Serialize;

/// crate semver，来自 Cargo.toml
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前支持的最高数据库 migration 版本，由 build.rs 扫描 migrations/ 生成。
/// 启动时若 DB 版本高于此值则拒绝打开（防 downgrade 导致 schema 不兼容）。
pub const HUB_DB_VERSION: i64 = parse_db_version(env!("HUB_DB_VERSION"));

/// 编译期解析版本号字符串为 i64（build.rs 只会输出纯数字）
const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 健康检查 / 日志用的构建信息快照
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: &'static str,
    pub build_time: &'static str,
    pub db_version: i64,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: HUB_VERSION,
        git_sha: GIT_SHA,
        build_time: BUILD_TIME,
        db_version: HUB_DB_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_version_matches_migrations() {
        assert!(HUB_DB_VERSION >= 2);
        assert_eq!(parse_db_version("12"), 12);
        assert!(build_info().version.chars().next().unwrap().is_ascii_digit());
    }
}
