/// Prefix shared by every local service pmm-admin installs
pub const LOCAL_SERVICE_PREFIX: &str = "pmm-";

/// Catalog tag prefixes
pub const TAG_ALIAS: &str = "alias_";
pub const TAG_NODE_TYPE: &str = "nodetype_";
pub const TAG_REPLSET: &str = "replset_";
pub const TAG_CLUSTER: &str = "cluster_";
pub const TAG_SCHEME: &str = "scheme_";

/// KV key names under `<node>/<service_id>/`
pub const KV_DSN: &str = "dsn";
pub const KV_OPTS: &str = "opts";

/// QAN API path prefix on the PMM server
pub const QAN_API_PREFIX: &str = "/qan-api";

/// Header the QAN API sets on /ping
pub const QAN_API_VERSION_HEADER: &str = "X-Percona-Qan-Api-Version";

/// Service name used in relayed agent commands
pub const QAN_CMD_SERVICE: &str = "qan";
pub const CMD_START_TOOL: &str = "StartTool";
pub const CMD_STOP_TOOL: &str = "StopTool";
