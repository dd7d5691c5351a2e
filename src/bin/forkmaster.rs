fn main() -> anyhow::Result<()> {
    forkmaster::fm::main()
}
