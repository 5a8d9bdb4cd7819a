use tonic_build::manual::{Builder, Method, Service};

fn duplex(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("crate::StrictCodec")
        .client_streaming()
        .server_streaming()
        .build()
}

fn main() {
    let portal = Service::builder()
        .name("Portal")
        .package("portal")
        .method(duplex(
            "open_portal",
            "OpenPortal",
            "crate::OpenPortalRequest",
            "crate::OpenPortalResponse",
        ))
        .method(duplex(
            "create_portal",
            "CreatePortal",
            "crate::CreatePortalRequest",
            "crate::CreatePortalResponse",
        ))
        .build();

    Builder::new().compile(&[portal]);
}
