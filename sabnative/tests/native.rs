//! Tests de bout en bout du protocole natif : poignée de main,
//! cycle de vie d'un flux de lecture, déplacement, cookie invalide.

use std::sync::Arc;
use std::time::Duration;

use sabcore::{memblockq::BlockQAttr, MemPool, SampleFormat, SampleSpec};
use sabmix::{Core, LatencySpec, NullSinkBackend, Sink, SinkNewData};
use sabnative::{Context, NativeServer, ServerAddress};
use sabwire::{ErrCode, COOKIE_SIZE};

fn spec() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap()
}

async fn make_sink(core: &Arc<Core>, name: &str) -> Arc<Sink> {
    let mut data = SinkNewData::new(name, spec()).unwrap();
    data.latency = LatencySpec::Fixed(Duration::from_millis(10));
    let sink = Sink::new(core, data).unwrap();
    sink.put(Box::new(NullSinkBackend::new())).unwrap();
    sink
}

async fn start_server() -> (Arc<Core>, NativeServer, ServerAddress, [u8; COOKIE_SIZE]) {
    let core = Core::new(MemPool::new(64 * 1024, 1024));
    make_sink(&core, "null").await;
    let cookie = [0x5a; COOKIE_SIZE];
    let server = NativeServer::bind(
        core.clone(),
        ServerAddress::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        },
        cookie,
    )
    .await
    .unwrap();
    let address = ServerAddress::Tcp {
        host: "127.0.0.1".into(),
        port: server.port().unwrap(),
    };
    (core, server, address, cookie)
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_registers_client() {
    let (core, _server, address, cookie) = start_server().await;
    let context = Context::connect_with_cookie(&address, "pacat", cookie)
        .await
        .unwrap();
    // Le client est enregistré côté serveur avec son nom.
    let clients = core.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].name(), "pacat");
    // Une requête quelconque aboutit.
    let (_blocks, _bytes, accumulated, _) = context.stat().await.unwrap();
    assert!(accumulated > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn playback_lifecycle() {
    let (core, _server, address, cookie) = start_server().await;
    let context = Context::connect_with_cookie(&address, "pacat", cookie)
        .await
        .unwrap();

    let attr = BlockQAttr {
        maxlength: 204800,
        tlength: 10240,
        prebuf: 4096,
        minreq: 1024,
    };
    let mut stream = context
        .create_playback_stream(Some("null"), "test tone", spec(), attr)
        .await
        .unwrap();
    assert_eq!(stream.channel(), 0);
    assert_eq!(stream.sink_name.as_deref(), Some("null"));
    assert_eq!(stream.attr.maxlength, 204800);
    assert_eq!(stream.attr.tlength, 10240);
    assert_eq!(stream.attr.prebuf, 4096);
    assert_eq!(stream.attr.minreq, 1024);
    assert!(core.sink_input_by_index(stream.stream_index).is_some());

    // Le serveur demande des octets ; on écrit puis on draine.
    let writable = stream.wait_writable().await.unwrap();
    assert!(writable >= 4096, "{writable}");
    stream.write(&vec![0x11u8; 4096]).unwrap();
    tokio::time::timeout(Duration::from_secs(5), stream.drain())
        .await
        .expect("drain timed out")
        .unwrap();

    let (own_usec, _device_usec) = stream.latency().await.unwrap();
    // Après drain, la file est essentiellement vide.
    assert!(own_usec < 500_000, "{own_usec}");

    let index = stream.stream_index;
    stream.delete().await.unwrap();
    assert!(core.sink_input_by_index(index).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn move_stream_emits_change_event() {
    let (core, _server, address, cookie) = start_server().await;
    make_sink(&core, "a").await;
    make_sink(&core, "b").await;
    let context = Context::connect_with_cookie(&address, "mover", cookie)
        .await
        .unwrap();

    // Abonnement aux changements de sink-inputs (facilité 2).
    let mut events = context.subscribe(1 << 2).await.unwrap();

    let attr = BlockQAttr {
        maxlength: 204800,
        tlength: 10240,
        prebuf: 0,
        minreq: 1024,
    };
    let stream = context
        .create_playback_stream(Some("a"), "movable", spec(), attr)
        .await
        .unwrap();
    let index = stream.stream_index;

    // L'événement NEW de la création arrive d'abord.
    context.move_sink_input(index, "b").await.unwrap();

    let input = core.sink_input_by_index(index).unwrap();
    assert_eq!(input.sink().unwrap().name, "b");
    assert_eq!(core.sink_by_name("a").unwrap().linked_by(), 0);
    assert_eq!(core.sink_by_name("b").unwrap().linked_by(), 1);

    let mut saw_change = false;
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some((facility, kind, idx))) => {
                assert_eq!(facility, 2);
                if kind == 1 && idx == index {
                    saw_change = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_change, "no CHANGE event for the moved stream");
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_cookie_is_access_denied() {
    let (core, _server, address, _cookie) = start_server().await;
    let wrong = [0x00; COOKIE_SIZE];
    let err = Context::connect_with_cookie(&address, "intruder", wrong)
        .await
        .expect_err("connect must fail");
    match err {
        sabnative::NativeError::Server(code) => assert_eq!(code, ErrCode::Access),
        other => panic!("unexpected error {other:?}"),
    }
    // Aucun client n'a été enregistré.
    assert!(core.clients().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn record_from_monitor_captures_playback() {
    let (core, _server, address, cookie) = start_server().await;
    let context = Context::connect_with_cookie(&address, "rec", cookie)
        .await
        .unwrap();

    let mut record = context
        .create_record_stream(Some("null.monitor"), "capture", spec())
        .await
        .unwrap();
    assert_eq!(record.source_name.as_deref(), Some("null.monitor"));
    assert!(core.source_output_by_index(record.stream_index).is_some());

    // Le monitor rend du silence en continu : peek/drop doit avancer.
    let chunk = tokio::time::timeout(Duration::from_secs(5), record.peek())
        .await
        .expect("no capture data")
        .unwrap();
    assert!(!chunk.is_empty());
    let len = chunk.length;
    record.drop_bytes(len);

    record.delete().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_command_fires_token() {
    let (_core, server, address, cookie) = start_server().await;
    let token = server.exit_requested();
    let context = Context::connect_with_cookie(&address, "quitter", cookie)
        .await
        .unwrap();
    context.exit().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .expect("exit was not requested");
}
