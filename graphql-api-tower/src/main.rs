fn main() -> anyhow::Result<()> {
    graphql_api_tower::main()
}
