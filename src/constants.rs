/// Application constants

// Roll formula
pub const ROLL_HEX_CHARS: usize = 7;
pub const ROLL_MODULUS: u64 = 100_000;
pub const ROLL_SCALE: u32 = 3; // value = n / 1000
pub const ROLL_DOMAIN_MAX: i64 = 100;

// Odds ranges are laid out on a 0.01 grid
pub const RANGE_STEP_CENTS: i64 = 1;

// Randomness pool
pub const SEED_POOL_MIN_SIZE: usize = 100;
pub const SEED_POOL_BATCH_SIZE: usize = 200;
pub const SEED_POOL_RETRY_SECS: u64 = 5;
pub const SERVER_SEED_BYTES: usize = 32;

// Money columns keep cents
pub const MONEY_DP: u32 = 2;

// Case opening
pub const MAX_OPEN_COUNT: u32 = 5;
pub const DAILY_CASE_COOLDOWN_HOURS: i64 = 24;

// Battles
pub const MIN_BATTLE_PLAYERS: u32 = 2;
pub const MAX_BATTLE_PLAYERS: u32 = 4;
pub const BATTLE_ROUND_DELAY_MS: u64 = 5_000;
pub const BATTLE_EXPIRY_SECS: u64 = 3_600;
pub const BATTLE_CANCEL_RETRY_MS: u64 = 1_000;

// API version
pub const API_VERSION: &str = "v1";

// WebSocket configuration
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const WS_CLIENT_TIMEOUT_SECS: u64 = 60;
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// Event names
pub const EVENT_USER_BALANCE: &str = "user.balance";
pub const EVENT_CASE_OPENED: &str = "case.opened";
pub const EVENT_BATTLE_CREATED: &str = "battle.created";
pub const EVENT_BATTLE_JOIN: &str = "battle.join";
pub const EVENT_BATTLE_QUIT: &str = "battle.quit";
pub const EVENT_BATTLE_READY: &str = "battle.ready";
pub const EVENT_BATTLE_START: &str = "battle.start";
pub const EVENT_BATTLE_ROUND: &str = "battle.round";
pub const EVENT_BATTLE_END: &str = "battle.end";
pub const EVENT_BATTLE_CANCEL: &str = "battle.cancel";
