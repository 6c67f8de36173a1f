//! Incoming call dispatch onto local objects

use std::sync::Arc;

use capfs_core::{
    ByteStream, CancelHandle, CapKind, Capability, EntrySink, FsError, FsResult, MainView,
    Method, Payload,
};

use super::proxy::{import_byte_stream, import_entry_sink};
use super::{ConnState, Export, Target};

pub(super) async fn dispatch(
    state: &Arc<ConnState>,
    target: Target,
    method: Method,
) -> FsResult<Payload> {
    match target {
        Target::Main(main) => dispatch_main(state, main, method).await,
        Target::Object(Export::Node(cap)) => dispatch_node(state, cap, method).await,
        Target::Object(Export::EntrySink(sink)) => dispatch_entry_sink(state, sink, method).await,
        Target::Object(Export::ByteStream(stream)) => {
            dispatch_byte_stream(state, stream, method).await
        }
        Target::Object(Export::Handle(handle)) => dispatch_handle(state, handle, method),
    }
}

/// Refuse a method the target does not offer, releasing anything it carried.
fn unsupported(state: &ConnState, method: Method) -> FsError {
    for desc in method.descriptors() {
        state.release(desc.id);
    }
    FsError::NotImplemented
}

fn export_handle(state: &ConnState, handle: CancelHandle) -> Payload {
    Payload::Capability(state.export(Export::Handle(handle), CapKind::Handle))
}

async fn dispatch_main(
    state: &Arc<ConnState>,
    main: Arc<dyn MainView>,
    method: Method,
) -> FsResult<Payload> {
    match method {
        Method::Root => {
            let root = main.root().await?;
            Ok(Payload::Capability(state.export_node(root)))
        }
        Method::Restore { token } => {
            let node = main.restore(&token).await?;
            Ok(Payload::Capability(state.export_node(node)))
        }
        other => Err(unsupported(state, other)),
    }
}

async fn dispatch_node(
    state: &Arc<ConnState>,
    cap: Capability,
    method: Method,
) -> FsResult<Payload> {
    match method {
        Method::Stat => Ok(Payload::Stat(cap.stat().await?)),
        Method::Save => Ok(Payload::Token(cap.save().await?)),

        Method::List { sink } => {
            let sink = import_entry_sink(state, sink)?;
            let handle = cap.into_directory()?.list(sink).await?;
            Ok(export_handle(state, handle))
        }
        Method::Walk { name } => {
            let child = cap.into_directory()?.walk(&name).await?;
            Ok(Payload::Capability(state.export_node(child)))
        }

        Method::Create { name, executable } => {
            let file = cap.into_rw_directory()?.create(&name, executable).await?;
            Ok(Payload::Capability(
                state.export_node(Capability::RwFile(file)),
            ))
        }
        Method::Mkdir { name } => {
            let dir = cap.into_rw_directory()?.mkdir(&name).await?;
            Ok(Payload::Capability(
                state.export_node(Capability::RwDirectory(dir)),
            ))
        }
        Method::Delete { name } => {
            cap.into_rw_directory()?.delete(&name).await?;
            Ok(Payload::Unit)
        }

        Method::Read {
            start_at,
            amount,
            sink,
        } => {
            let sink = import_byte_stream(state, sink)?;
            let handle = cap.into_file()?.read(start_at, amount, sink).await?;
            Ok(export_handle(state, handle))
        }

        Method::Write { start_at } => {
            let session = cap.into_rw_file()?.write(start_at).await?;
            let sink = state.export(Export::ByteStream(session.sink), CapKind::ByteStream);
            let cancel = state.export(Export::Handle(session.cancel), CapKind::Handle);
            Ok(Payload::WriteSession { sink, cancel })
        }
        Method::SetExec { exec } => {
            cap.into_rw_file()?.set_exec(exec).await?;
            Ok(Payload::Unit)
        }
        Method::Truncate { size } => {
            cap.into_rw_file()?.truncate(size).await?;
            Ok(Payload::Unit)
        }

        other => Err(unsupported(state, other)),
    }
}

async fn dispatch_entry_sink(
    state: &Arc<ConnState>,
    sink: Arc<dyn EntrySink>,
    method: Method,
) -> FsResult<Payload> {
    match method {
        Method::Push { entries } => sink.push(entries).await.map(|_| Payload::Unit),
        Method::EntriesDone => sink.done().await.map(|_| Payload::Unit),
        other => Err(unsupported(state, other)),
    }
}

async fn dispatch_byte_stream(
    state: &Arc<ConnState>,
    stream: Arc<dyn ByteStream>,
    method: Method,
) -> FsResult<Payload> {
    match method {
        Method::WriteBytes { data } => stream.write(data).await.map(|_| Payload::Unit),
        Method::BytesDone => stream.done().await.map(|_| Payload::Unit),
        Method::ExpectSize { size } => stream.expect_size(size).await.map(|_| Payload::Unit),
        other => Err(unsupported(state, other)),
    }
}

fn dispatch_handle(state: &Arc<ConnState>, handle: CancelHandle, method: Method) -> FsResult<Payload> {
    match method {
        Method::Cancel => {
            handle.cancel();
            Ok(Payload::Unit)
        }
        other => Err(unsupported(state, other)),
    }
}
