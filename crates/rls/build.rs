// Generates the gRPC and remote-write wire types. protox compiles the
// schemas without an external protoc binary.
fn main() -> Result<(), anyhow::Error> {
	let proto_files = [
		"proto/ext_authz.proto",
		"proto/rate_limit.proto",
		"proto/remote_write.proto",
		"proto/health.proto",
	];

	let descriptors = protox::compile(proto_files, ["proto/"])?;
	tonic_build::configure()
		.build_server(true)
		.build_client(true)
		.compile_fds(descriptors)?;

	for path in proto_files {
		println!("cargo:rerun-if-changed={path}");
	}
	Ok(())
}
