//! Tests d'intégration du cœur de routage : mixage observé par la
//! source monitor, propagation de volume plat, déplacement de flux,
//! cycle de vie.

use std::sync::Arc;
use std::time::Duration;

use sabcore::{CVolume, MemChunk, MemPool, SampleFormat, SampleSpec, SeekMode, Volume};
use sabmix::{
    Core, DeviceState, InputEvent, NullSinkBackend, OutputEvent, Sink, SinkInput,
    SinkInputNewData, SinkNewData, SourceOutput, SourceOutputNewData, StreamState, SuspendCause,
};

fn spec() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 2, 8000).unwrap()
}

fn core() -> Arc<Core> {
    Core::new(MemPool::new(64 * 1024, 256))
}

fn fast_sink_data(name: &str) -> SinkNewData {
    let mut data = SinkNewData::new(name, spec()).unwrap();
    data.latency = sabmix::LatencySpec::Fixed(Duration::from_millis(10));
    data
}

fn make_sink(core: &Arc<Core>, name: &str) -> Arc<Sink> {
    let sink = Sink::new(core, fast_sink_data(name)).unwrap();
    sink.put(Box::new(NullSinkBackend::new())).unwrap();
    sink
}

fn s16_chunk(pool: &MemPool, samples: &[i16]) -> MemChunk {
    let mut b = pool.alloc(samples.len() * 2).unwrap();
    {
        let d = b.try_mut().unwrap();
        for (i, s) in samples.iter().enumerate() {
            d[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
        }
    }
    MemChunk::new(b)
}

fn make_input(core: &Arc<Core>, sink: &Arc<Sink>) -> (Arc<SinkInput>, tokio::sync::mpsc::UnboundedReceiver<InputEvent>) {
    let mut data = SinkInputNewData::new(spec()).unwrap();
    data.attr.prebuf = 0;
    let (input, rx) = SinkInput::new(core, data).unwrap();
    input.put(sink).unwrap();
    (input, rx)
}

async fn next_data(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<OutputEvent>,
) -> Option<MemChunk> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(OutputEvent::Data(c))) => return Some(c),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_sees_mixed_streams() {
    let core = core();
    let sink = make_sink(&core, "null");
    let monitor = sink.monitor().unwrap();

    // Flux capturant le mix.
    let (output, mut out_rx) =
        SourceOutput::new(&core, SourceOutputNewData::new(spec()).unwrap()).unwrap();
    output.put(&monitor).unwrap();

    let (a, _arx) = make_input(&core, &sink);
    let (b, _brx) = make_input(&core, &sink);

    // Une seconde de matière constante sur chaque flux.
    for _ in 0..10 {
        a.write(0, SeekMode::Relative, s16_chunk(&core.pool, &[1000; 1600]))
            .unwrap();
        b.write(0, SeekMode::Relative, s16_chunk(&core.pool, &[200; 1600]))
            .unwrap();
    }

    // Quelque part dans la capture, la somme 1200 doit apparaître.
    let mut saw_sum = false;
    for _ in 0..40 {
        let Some(chunk) = next_data(&mut out_rx).await else {
            break;
        };
        let data = chunk.bytes();
        if data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .any(|s| (s - 1200).abs() <= 4)
        {
            saw_sum = true;
            break;
        }
    }
    assert!(saw_sum, "mixed sum never observed on the monitor");

    a.unlink().await;
    b.unlink().await;
    output.unlink().await;
    sink.unlink().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn flat_volume_invariant_holds() {
    let core = core();
    let sink = make_sink(&core, "flat");
    let (input, _rx) = make_input(&core, &sink);

    // Volume de flux à 50 % : le sink garde sa référence, le ratio
    // absorbe la différence.
    input.set_volume(&CVolume::uniform(2, Volume(0x8000)), false);
    let reference = sink.reference_volume();
    for c in 0..2 {
        let expect = reference.get(c).multiply(input.reference_ratio().get(c));
        let got = input.volume().get(c);
        assert!(
            (got.0 as i64 - expect.0 as i64).abs() <= 1,
            "channel {c}: {got:?} vs {expect:?}"
        );
    }

    // Baisse du volume du sink : chaque flux conserve son ratio.
    let ratio_before = input.reference_ratio();
    sink.set_volume(Some(&CVolume::uniform(2, Volume(0x4000))), false);
    assert_eq!(input.reference_ratio(), ratio_before);
    for c in 0..2 {
        let expect = sink
            .reference_volume()
            .get(c)
            .multiply(input.reference_ratio().get(c));
        let got = input.volume().get(c);
        assert!(
            (got.0 as i64 - expect.0 as i64).abs() <= 0x40,
            "channel {c}: {got:?} vs {expect:?}"
        );
    }

    input.unlink().await;
    sink.unlink().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hardware_volume_change_pulls_reference() {
    let core = core();
    let sink = make_sink(&core, "hw");
    let (input, _rx) = make_input(&core, &sink);

    let real_ratio_before = input.real_ratio();
    let new_real = CVolume::uniform(2, Volume(0xC000));
    sink.volume_changed(&new_real);

    // La référence rejoint le réel ; le flux conserve son volume
    // relatif au sink (son ratio de référence devient son ratio réel).
    assert_eq!(sink.reference_volume(), new_real);
    assert_eq!(input.reference_ratio(), real_ratio_before);
    for c in 0..2 {
        let expect = new_real.get(c).multiply(real_ratio_before.get(c));
        let got = input.volume().get(c);
        assert!(
            (got.0 as i64 - expect.0 as i64).abs() <= 0x80,
            "channel {c}: {got:?} vs {expect:?}"
        );
    }

    input.unlink().await;
    sink.unlink().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn move_between_sinks() {
    let core = core();
    let a = make_sink(&core, "a");
    let b = make_sink(&core, "b");
    let (input, _rx) = make_input(&core, &a);

    assert_eq!(a.linked_by(), 1);
    assert_eq!(b.linked_by(), 0);

    input.write(0, SeekMode::Relative, s16_chunk(&core.pool, &[7; 800])).unwrap();
    input.move_to(&b).await.unwrap();

    assert_eq!(a.linked_by(), 0);
    assert_eq!(b.linked_by(), 1);
    assert!(input.sink().unwrap().name == "b");

    input.unlink().await;
    a.unlink().await;
    b.unlink().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unlink_is_terminal_and_idempotent() {
    let core = core();
    let sink = make_sink(&core, "gone");
    let (input, mut rx) = make_input(&core, &sink);
    let input_idx = input.idx();

    sink.unlink().await;
    assert_eq!(sink.state(), DeviceState::Unlinked);
    // Les flux attachés ont été tués.
    assert_eq!(input.state(), StreamState::Unlinked);
    assert!(core.sink_input_by_index(input_idx).is_none());
    assert!(core.sink_by_index(sink.idx()).is_none());
    let mut killed = false;
    while let Ok(ev) = rx.try_recv() {
        if matches!(ev, InputEvent::Killed) {
            killed = true;
        }
    }
    assert!(killed, "no Killed event for the attached stream");

    // Double unlink : aucun effet.
    sink.unlink().await;
    assert_eq!(sink.state(), DeviceState::Unlinked);
}

#[tokio::test(flavor = "multi_thread")]
async fn suspend_cause_bitset() {
    let core = core();
    let sink = make_sink(&core, "s");
    sink.suspend(SuspendCause::USER, true).unwrap();
    sink.suspend(SuspendCause::IDLE, true).unwrap();
    assert_eq!(sink.state(), DeviceState::Suspended);
    // Lever une seule cause ne réveille pas.
    sink.suspend(SuspendCause::USER, false).unwrap();
    assert_eq!(sink.state(), DeviceState::Suspended);
    sink.suspend(SuspendCause::IDLE, false).unwrap();
    assert!(matches!(
        sink.state(),
        DeviceState::Idle | DeviceState::Running
    ));
    sink.unlink().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_flow_and_drain() {
    let core = core();
    let sink = make_sink(&core, "drain");
    let (input, mut rx) = make_input(&core, &sink);

    input
        .write(0, SeekMode::Relative, s16_chunk(&core.pool, &[5; 400]))
        .unwrap();
    input.drain(42).unwrap();

    let mut requested = false;
    let mut drained = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline && !(requested && drained) {
        match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(InputEvent::RequestBytes(n))) => {
                assert!(n > 0);
                requested = true;
            }
            Ok(Some(InputEvent::Drained(tag))) => {
                assert_eq!(tag, 42);
                drained = true;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert!(requested, "no REQUEST flow");
    assert!(drained, "drain never completed");

    input.unlink().await;
    sink.unlink().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corked_stream_idles_the_sink() {
    let core = core();
    let sink = make_sink(&core, "cork");
    let (input, _rx) = make_input(&core, &sink);
    assert_eq!(sink.state(), DeviceState::Running);
    input.cork(true).unwrap();
    assert_eq!(input.state(), StreamState::Corked);
    assert_eq!(sink.state(), DeviceState::Idle);
    input.cork(false).unwrap();
    assert_eq!(sink.state(), DeviceState::Running);
    input.unlink().await;
    sink.unlink().await;
}
