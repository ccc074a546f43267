//! The main entrypoint for ozite, which just calls into the library.

fn main() {
    ozite_utils::run_main(ozite_lib::cli::run)
}
