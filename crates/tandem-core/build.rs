/// Generates the gRPC client and server bindings for the `WorkerService`
/// using `tonic-build`'s manual service builder.
///
/// The request and response messages are declared by hand with
/// `#[derive(prost::Message)]` in `src/proto.rs`, so code generation only has
/// to emit the service plumbing. This keeps the build free of a `protoc`
/// toolchain requirement while still speaking the protobuf wire format.
///
/// # Output
///
/// Generated code lands in `OUT_DIR` as `tandem.worker.v1.WorkerService.rs`
/// and is pulled in with:
///
/// ```rust
/// include!(concat!(env!("OUT_DIR"), "/tandem.worker.v1.WorkerService.rs"));
/// ```
///
/// This yields the `worker_service_server` and `worker_service_client`
/// modules.
fn main() {
    let worker_service = tonic_build::manual::Service::builder()
        .name("WorkerService")
        .package("tandem.worker.v1")
        .method(
            tonic_build::manual::Method::builder()
                .name("do_work")
                .route_name("DoWork")
                .input_type("crate::proto::WorkRequest")
                .output_type("crate::proto::WorkResponse")
                .codec_path("tonic_prost::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[worker_service]);
}
