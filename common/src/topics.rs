pub const TOPIC_AUTO_SETTINGS: &str = "greenhouse/auto/settings";
pub const TOPIC_AUTO_MODE: &str = "greenhouse/auto/mode";

pub const TOPIC_CONTROLLER_STATE: &str = "greenhouse/controller/state";
pub const TOPIC_CONTROLLER_NOTICE: &str = "greenhouse/controller/notice";

pub const TOPIC_CMD_DEVICE_PREFIX: &str = "greenhouse/cmnd/device/";
pub const TOPIC_CMD_DEVICE_FILTER: &str = "greenhouse/cmnd/device/+";
pub const TOPIC_CMD_EMERGENCY_STOP: &str = "greenhouse/cmnd/emergency_stop";
