//! Native protocol command codes.
//!
//! The first two fields of every control packet are `(u32 command,
//! u32 tag)`. Codes 0..=59 are client→server (plus the three shared
//! bookkeeping codes), 60..=67 are server→client events.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Error = 0,
    /// Synthetic, delivered locally when a reply timer expires. Never
    /// sent on the wire.
    Timeout = 1,
    Reply = 2,

    CreatePlaybackStream = 3,
    DeletePlaybackStream = 4,
    CreateRecordStream = 5,
    DeleteRecordStream = 6,
    Exit = 7,
    Auth = 8,
    SetClientName = 9,
    LookupSink = 10,
    LookupSource = 11,
    DrainPlaybackStream = 12,
    Stat = 13,
    GetPlaybackLatency = 14,
    CreateUploadStream = 15,
    DeleteUploadStream = 16,
    FinishUploadStream = 17,
    PlaySample = 18,
    RemoveSample = 19,

    GetServerInfo = 20,
    GetSinkInfo = 21,
    GetSinkInfoList = 22,
    GetSourceInfo = 23,
    GetSourceInfoList = 24,
    GetClientInfo = 25,
    GetClientInfoList = 26,
    GetSinkInputInfo = 27,
    GetSinkInputInfoList = 28,
    GetSourceOutputInfo = 29,
    GetSourceOutputInfoList = 30,
    GetModuleInfo = 31,
    GetModuleInfoList = 32,
    Subscribe = 33,
    SetSinkVolume = 34,
    SetSinkInputVolume = 35,
    SetSourceVolume = 36,
    SetSinkMute = 37,
    SetSinkInputMute = 38,
    SetSourceMute = 39,
    CorkPlaybackStream = 40,
    FlushPlaybackStream = 41,
    TriggerPlaybackStream = 42,
    PrebufPlaybackStream = 43,
    CorkRecordStream = 44,
    FlushRecordStream = 45,
    GetRecordLatency = 46,
    MoveSinkInput = 47,
    MoveSourceOutput = 48,
    SuspendSink = 49,
    SuspendSource = 50,
    SetDefaultSink = 51,
    SetDefaultSource = 52,
    KillClient = 53,
    KillSinkInput = 54,
    KillSourceOutput = 55,
    SetStreamBufferAttr = 56,
    SetPlaybackStreamName = 57,
    SetRecordStreamName = 58,

    /// Server → client: please write this many more bytes.
    Request = 60,
    PlaybackStreamKilled = 61,
    RecordStreamKilled = 62,
    UploadStreamKilled = 63,
    SubscribeEvent = 64,
    PlaybackStreamUnderflow = 65,
    PlaybackStreamOverflow = 66,
    PlaybackStreamStarted = 67,
}

impl Command {
    pub fn from_wire(v: u32) -> Option<Command> {
        Some(match v {
            0 => Command::Error,
            1 => Command::Timeout,
            2 => Command::Reply,
            3 => Command::CreatePlaybackStream,
            4 => Command::DeletePlaybackStream,
            5 => Command::CreateRecordStream,
            6 => Command::DeleteRecordStream,
            7 => Command::Exit,
            8 => Command::Auth,
            9 => Command::SetClientName,
            10 => Command::LookupSink,
            11 => Command::LookupSource,
            12 => Command::DrainPlaybackStream,
            13 => Command::Stat,
            14 => Command::GetPlaybackLatency,
            15 => Command::CreateUploadStream,
            16 => Command::DeleteUploadStream,
            17 => Command::FinishUploadStream,
            18 => Command::PlaySample,
            19 => Command::RemoveSample,
            20 => Command::GetServerInfo,
            21 => Command::GetSinkInfo,
            22 => Command::GetSinkInfoList,
            23 => Command::GetSourceInfo,
            24 => Command::GetSourceInfoList,
            25 => Command::GetClientInfo,
            26 => Command::GetClientInfoList,
            27 => Command::GetSinkInputInfo,
            28 => Command::GetSinkInputInfoList,
            29 => Command::GetSourceOutputInfo,
            30 => Command::GetSourceOutputInfoList,
            31 => Command::GetModuleInfo,
            32 => Command::GetModuleInfoList,
            33 => Command::Subscribe,
            34 => Command::SetSinkVolume,
            35 => Command::SetSinkInputVolume,
            36 => Command::SetSourceVolume,
            37 => Command::SetSinkMute,
            38 => Command::SetSinkInputMute,
            39 => Command::SetSourceMute,
            40 => Command::CorkPlaybackStream,
            41 => Command::FlushPlaybackStream,
            42 => Command::TriggerPlaybackStream,
            43 => Command::PrebufPlaybackStream,
            44 => Command::CorkRecordStream,
            45 => Command::FlushRecordStream,
            46 => Command::GetRecordLatency,
            47 => Command::MoveSinkInput,
            48 => Command::MoveSourceOutput,
            49 => Command::SuspendSink,
            50 => Command::SuspendSource,
            51 => Command::SetDefaultSink,
            52 => Command::SetDefaultSource,
            53 => Command::KillClient,
            54 => Command::KillSinkInput,
            55 => Command::KillSourceOutput,
            56 => Command::SetStreamBufferAttr,
            57 => Command::SetPlaybackStreamName,
            58 => Command::SetRecordStreamName,
            60 => Command::Request,
            61 => Command::PlaybackStreamKilled,
            62 => Command::RecordStreamKilled,
            63 => Command::UploadStreamKilled,
            64 => Command::SubscribeEvent,
            65 => Command::PlaybackStreamUnderflow,
            66 => Command::PlaybackStreamOverflow,
            67 => Command::PlaybackStreamStarted,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for v in 0..=67u32 {
            if let Some(c) = Command::from_wire(v) {
                assert_eq!(c as u32, v);
            }
        }
        assert_eq!(Command::from_wire(59), None);
        assert_eq!(Command::from_wire(200), None);
        assert_eq!(Command::Request as u32, 60);
        assert_eq!(Command::UploadStreamKilled as u32, 63);
    }
}
