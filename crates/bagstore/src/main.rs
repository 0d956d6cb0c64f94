fn main() -> anyhow::Result<()> {
    bagstore::init();
    bagstore::ui::cli::run()
}
