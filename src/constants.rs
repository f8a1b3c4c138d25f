//! Shared constants used across the application.

/// Thread listing endpoint of the NGA app API.
pub const DEFAULT_API_URL: &str = "https://bbs.nga.cn/app_api.php?__lib=post&__act=list";

/// Base URL used to build deep links in notifications.
pub const DEFAULT_FORUM_URL: &str = "https://bbs.nga.cn";

/// User agent string used for forum API requests.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Posts per page when the API omits `perPage`.
pub const DEFAULT_POSTS_PER_PAGE: u32 = 20;

/// Check interval (seconds) used when a subscription does not set one.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;
