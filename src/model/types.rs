pub type ChannelId = u64;
pub type GuildId = u64;
pub type Ssrc = u32;
pub type UserId = u64;

/// 16-bit signed PCM, as the voice transport sends and receives it.
pub type AudioSample = i16;

/// f32 mono samples, as the batch recognizer wants them.
pub type SttSample = f32;
