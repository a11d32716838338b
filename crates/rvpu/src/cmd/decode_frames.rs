use rvpu_frame::{decode_stream, Primitive};

use crate::cmd::DecodeFramesArgs;
use crate::exit::{frame_error, io_error, CliResult, SUCCESS};
use crate::output::{print_primitives, OutputFormat};

pub fn run(args: DecodeFramesArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = std::fs::read(&args.file)
        .map_err(|err| io_error(&format!("failed reading {}", args.file.display()), err))?;

    let (prims, failure) = collect(bytes);
    print_primitives(&prims, format);

    match failure {
        Some(err) => Err(frame_error(
            &format!("stream corrupt after {} primitives", prims.len()),
            err,
        )),
        None => Ok(SUCCESS),
    }
}

/// Primitives decoded before the first error, and that error.
fn collect(bytes: Vec<u8>) -> (Vec<Primitive>, Option<rvpu_frame::FrameError>) {
    let mut prims = Vec::new();
    for item in decode_stream(bytes) {
        match item {
            Ok(prim) => prims.push(prim),
            Err(err) => return (prims, Some(err)),
        }
    }
    (prims, None)
}

#[cfg(test)]
mod tests {
    use rvpu_frame::{FrameError, PrimitiveCode};

    use super::*;

    #[test]
    fn collects_every_primitive() {
        let (prims, failure) = collect(b"1:2:{}4:0:5:0:".to_vec());
        assert!(failure.is_none());
        let kinds: Vec<_> = prims.iter().map(Primitive::kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(PrimitiveCode::Init),
                Some(PrimitiveCode::Start),
                Some(PrimitiveCode::Wait)
            ]
        );
    }

    #[test]
    fn stops_at_truncated_frame() {
        let (prims, failure) = collect(b"12:0:6:10:abc".to_vec());
        assert_eq!(prims.len(), 1);
        assert!(matches!(failure, Some(FrameError::TruncatedFrame { declared: 10, available: 3 })));
    }
}
